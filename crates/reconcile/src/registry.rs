//! Explicit registry of long-lived named contexts
//!
//! Contexts such as local emulators or dev-mode build watchers outlive a single
//! handler call. The bootstrap layer owns one registry, injects it into the
//! orchestrator, and everything still registered is disposed when the registry
//! is dropped.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A context that must be released explicitly
pub trait Disposable: Send + Sync {
    fn dispose(&self) -> anyhow::Result<()>;
}

struct Entry {
    context: Arc<dyn Disposable>,
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct ContextRegistry {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a context under `name`, disposing any context it replaces
    pub fn register<T: Disposable + 'static>(&self, name: impl Into<String>, context: Arc<T>) {
        let name = name.into();
        let entry = Entry {
            context: context.clone(),
            any: context,
        };
        let replaced = self.entries().insert(name.clone(), entry);
        if let Some(old) = replaced {
            log::debug!("Replacing context '{name}'");
            dispose_logged(&name, old.context.as_ref());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().contains_key(name)
    }

    /// Look up a context by name and concrete type
    pub fn get<T: Disposable + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let any = self.entries().get(name)?.any.clone();
        any.downcast::<T>().ok()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }

    /// Dispose and remove one context; returns false if it was not registered
    pub fn dispose(&self, name: &str) -> anyhow::Result<bool> {
        let Some(entry) = self.entries().remove(name) else {
            return Ok(false);
        };
        entry.context.dispose()?;
        log::debug!("Disposed context '{name}'");
        Ok(true)
    }

    /// Dispose every registered context, returning how many were disposed
    ///
    /// Failures are logged; every context is removed regardless.
    pub fn dispose_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries());
        let count = entries.len();
        for (name, entry) in entries {
            dispose_logged(&name, entry.context.as_ref());
        }
        count
    }
}

fn dispose_logged(name: &str, context: &dyn Disposable) {
    if let Err(e) = context.dispose() {
        log::warn!("Failed to dispose context '{name}': {e:#}");
    }
}

impl Drop for ContextRegistry {
    fn drop(&mut self) {
        let count = self.dispose_all();
        if count > 0 {
            log::debug!("Disposed {count} contexts on shutdown");
        }
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Watcher {
        disposed: AtomicUsize,
    }

    impl Disposable for Watcher {
        fn dispose(&self) -> anyhow::Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Broken;

    impl Disposable for Broken {
        fn dispose(&self) -> anyhow::Result<()> {
            anyhow::bail!("socket already closed")
        }
    }

    #[test]
    fn test_register_get_dispose() {
        let registry = ContextRegistry::new();
        let watcher = Arc::new(Watcher::default());
        registry.register("web", watcher.clone());

        assert!(registry.contains("web"));
        assert!(registry.get::<Watcher>("web").is_some());
        assert!(registry.get::<Broken>("web").is_none());

        assert!(registry.dispose("web").unwrap());
        assert!(!registry.dispose("web").unwrap());
        assert_eq!(watcher.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replacing_disposes_previous() {
        let registry = ContextRegistry::new();
        let first = Arc::new(Watcher::default());
        registry.register("web", first.clone());
        registry.register("web", Arc::new(Watcher::default()));
        assert_eq!(first.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.names(), vec!["web"]);
    }

    #[test]
    fn test_drop_disposes_everything() {
        let a = Arc::new(Watcher::default());
        let b = Arc::new(Watcher::default());
        {
            let registry = ContextRegistry::new();
            registry.register("a", a.clone());
            registry.register("b", b.clone());
            registry.register("broken", Arc::new(Broken));
        }
        assert_eq!(a.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(b.disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_error_is_returned() {
        let registry = ContextRegistry::new();
        registry.register("broken", Arc::new(Broken));
        assert!(registry.dispose("broken").is_err());
        assert!(!registry.contains("broken"));
    }
}
