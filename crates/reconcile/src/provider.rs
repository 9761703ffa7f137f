//! Provider contract: the lifecycle handlers a resource kind implements
//!
//! Providers never persist anything and are never called by user code; the
//! orchestrator picks exactly one handler per resource per run and records the
//! result.

use crate::error::DeclareError;
use crate::registry::ContextRegistry;
use crate::types::{Mode, Phase};
use anyhow::Result;
use statekit::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Information handed to every handler call
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    pub fqn: &'a str,
    pub stage: &'a str,
    pub phase: Phase,
    pub mode: Mode,
    /// Claim an existing object instead of failing with a conflict
    pub adopt: bool,
    /// Revision of the stored record before this call (0 if never created)
    pub seq: u64,
    pub registry: Option<&'a ContextRegistry>,
}

impl fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("fqn", &self.fqn)
            .field("stage", &self.stage)
            .field("phase", &self.phase)
            .field("mode", &self.mode)
            .field("adopt", &self.adopt)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Lifecycle handlers for one resource kind
///
/// Handlers must be deterministic in how they treat a given `(news, olds)`
/// pair: whether a change is applied in place or by replacement is the
/// provider's decision.
pub trait Provider: Send + Sync {
    /// Stable type tag, e.g. `"bucket"`
    fn kind(&self) -> &str;

    /// Reject malformed props before any handler runs
    ///
    /// Return an [`Invalid`] error to report a validation failure.
    fn validate(&self, _props: &Value) -> Result<()> {
        Ok(())
    }

    /// Create the object; called when no record exists (or adoption is requested)
    fn create(&self, ctx: &HandlerContext<'_>, id: &str, news: &Value) -> Result<Value>;

    /// Bring an existing object in line with `news`
    fn update(
        &self,
        ctx: &HandlerContext<'_>,
        id: &str,
        news: &Value,
        olds: &Value,
        prior_output: &Value,
    ) -> Result<Value>;

    /// Remove the object
    fn delete(&self, ctx: &HandlerContext<'_>, id: &str, olds: &Value, prior_output: &Value)
    -> Result<()>;
}

/// Returned by handlers when an object with the same identity already exists
/// and adoption was not requested
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Conflict(String);

impl Conflict {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Returned by `validate` (or a handler) for props the provider cannot accept
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Invalid(String);

impl Invalid {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Providers by kind
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; each kind can only be registered once
    pub fn register(&mut self, provider: impl Provider + 'static) -> Result<(), DeclareError> {
        self.register_arc(Arc::new(provider))
    }

    pub fn register_arc(&mut self, provider: Arc<dyn Provider>) -> Result<(), DeclareError> {
        let kind = provider.kind().to_string();
        if self.providers.contains_key(&kind) {
            return Err(DeclareError::DuplicateKind(kind));
        }
        log::debug!("Registered provider for kind '{kind}'");
        self.providers.insert(kind, provider);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl Provider for Noop {
        fn kind(&self) -> &str {
            self.0
        }

        fn create(&self, _ctx: &HandlerContext<'_>, _id: &str, news: &Value) -> Result<Value> {
            Ok(news.clone())
        }

        fn update(
            &self,
            _ctx: &HandlerContext<'_>,
            _id: &str,
            news: &Value,
            _olds: &Value,
            _prior_output: &Value,
        ) -> Result<Value> {
            Ok(news.clone())
        }

        fn delete(
            &self,
            _ctx: &HandlerContext<'_>,
            _id: &str,
            _olds: &Value,
            _prior_output: &Value,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register(Noop("bucket")).unwrap();
        registry.register(Noop("queue")).unwrap();

        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["bucket", "queue"]);
        assert!(registry.get("bucket").is_some());
        assert!(registry.get("dns").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut registry = ProviderRegistry::new();
        registry.register(Noop("bucket")).unwrap();
        assert_eq!(
            registry.register(Noop("bucket")),
            Err(DeclareError::DuplicateKind("bucket".into()))
        );
    }

    #[test]
    fn test_default_validate_accepts() {
        assert!(Noop("x").validate(&Value::Null).is_ok());
    }
}
