//! The backend-agnostic state store contract

use crate::error::{Error, Result};
use crate::record::StateRecord;
use rayon::prelude::*;
use std::fmt;

/// Key/value persistence for state records, keyed by FQN
///
/// Implementations only store and retrieve; ordering and per-key write
/// serialization are the caller's responsibility.
pub trait StateStore: Send + Sync {
    /// Acquire backend resources (connections, workers). Must be idempotent.
    fn init(&self) -> Result<()>;

    /// Release what `init` acquired
    fn deinit(&self) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<StateRecord>>;

    /// Overwrite the record stored under `key`
    fn set(&self, key: &str, record: &StateRecord) -> Result<()>;

    /// Remove `key`; absent keys are not an error
    fn delete(&self, key: &str) -> Result<()>;

    /// All stored keys, without the namespace prefix, sorted
    fn list(&self) -> Result<Vec<String>>;

    fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Prefix isolating this store's keys inside a shared physical backend
    fn namespace(&self) -> &str;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

impl fmt::Debug for dyn StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend())
            .field("namespace", &self.namespace())
            .finish()
    }
}

/// Scoped use of a store: `init` on creation, `deinit` on drop
pub struct StoreSession<'a> {
    store: &'a dyn StateStore,
}

/// Open a session on `store`
pub fn session(store: &dyn StateStore) -> Result<StoreSession<'_>> {
    store.init()?;
    log::debug!(
        "Opened {} state store session (namespace '{}')",
        store.backend(),
        store.namespace()
    );
    Ok(StoreSession { store })
}

impl<'a> std::ops::Deref for StoreSession<'a> {
    type Target = dyn StateStore + 'a;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}

impl Drop for StoreSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.deinit() {
            log::warn!("Failed to release {} state store: {e}", self.store.backend());
        }
    }
}

/// Check that a key is a relative, slash-separated path of non-empty segments
pub fn check_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.contains('\\')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// Physical key of `key` inside `namespace`
pub(crate) fn qualify(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{namespace}/{key}")
    }
}

/// Inverse of [`qualify`]; `None` for keys outside the namespace
pub(crate) fn unqualify<'k>(namespace: &str, physical: &'k str) -> Option<&'k str> {
    if namespace.is_empty() {
        Some(physical)
    } else {
        physical
            .strip_prefix(namespace)
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

/// Copy every record from one store into another
///
/// Records are decoded by `from` and re-encoded by `to`, so migrating between
/// stores configured with different passphrases rotates the secret key.
/// Returns the number of records copied.
pub fn migrate(from: &dyn StateStore, to: &dyn StateStore) -> Result<usize> {
    let _source = session(from)?;
    let _target = session(to)?;

    let keys = from.list()?;
    log::info!(
        "Migrating {} records from {} to {}",
        keys.len(),
        from.backend(),
        to.backend()
    );

    let copied = keys
        .par_iter()
        .map(|key| match from.get(key)? {
            Some(record) => to.set(key, &record).map(|()| 1),
            None => Ok(0),
        })
        .collect::<Result<Vec<usize>>>()?;

    Ok(copied.into_iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::codec::RecordCodec;
    use crate::secret::{Passphrase, SecretCodec};
    use crate::value::Value;

    fn sealing(passphrase: &str) -> RecordCodec {
        RecordCodec::new(SecretCodec::new(Passphrase::new(passphrase)).unwrap())
    }

    #[test]
    fn test_check_key() {
        assert!(check_key("app/dev/bucket").is_ok());
        assert!(check_key("a.b-c_d").is_ok());
        for bad in ["", "/abs", "a//b", "a/../b", "a/./b", "trailing/", "a\\b"] {
            assert!(
                matches!(check_key(bad), Err(Error::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_qualify_roundtrip() {
        assert_eq!(qualify("", "a/b"), "a/b");
        assert_eq!(qualify("team", "a/b"), "team/a/b");
        assert_eq!(unqualify("team", "team/a/b"), Some("a/b"));
        assert_eq!(unqualify("team", "teammate/a"), None);
        assert_eq!(unqualify("", "a/b"), Some("a/b"));
    }

    #[test]
    fn test_migrate_rotates_passphrase() {
        let old = MemoryStore::new("", sealing("old"));
        let mut record = StateRecord::new("app/dev/db", "database", "db");
        record.seq = 1;
        record.props = Value::map([("password", Value::secret("pw1"))]);
        old.set("app/dev/db", &record).unwrap();
        old.set("app/dev/cache", &StateRecord::new("app/dev/cache", "cache", "cache"))
            .unwrap();

        let new = MemoryStore::new("", sealing("new"));
        assert_eq!(migrate(&old, &new).unwrap(), 2);
        assert_eq!(new.count().unwrap(), 2);

        let moved = new.get("app/dev/db").unwrap().unwrap();
        assert_eq!(
            moved.props.get("password").and_then(Value::as_secret).map(|s| s.expose()),
            Some("pw1")
        );

        // The raw bytes are sealed under the new passphrase only
        let raw = new.raw("app/dev/db").unwrap();
        assert!(sealing("old").decode("app/dev/db", &raw).is_err());
    }

    #[test]
    fn test_count_matches_list() {
        let store = MemoryStore::new("", RecordCodec::plain());
        for id in ["a", "b", "c"] {
            let key = format!("app/dev/{id}");
            store.set(&key, &StateRecord::new(&key, "k", id)).unwrap();
        }
        assert_eq!(store.count().unwrap(), store.list().unwrap().len());
    }
}
