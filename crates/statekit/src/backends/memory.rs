//! In-process store, mostly for tests and dry runs

use crate::codec::RecordCodec;
use crate::error::Result;
use crate::record::StateRecord;
use crate::store::{StateStore, check_key, qualify, unqualify};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Entries = BTreeMap<String, Vec<u8>>;

/// Encoded records held in a shared in-memory map
///
/// Records still go through the [`RecordCodec`], so secrets are sealed exactly
/// as they would be on disk.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    namespace: String,
    codec: RecordCodec,
    entries: Arc<RwLock<Entries>>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>, codec: RecordCodec) -> Self {
        Self {
            namespace: namespace.into(),
            codec,
            entries: Arc::default(),
        }
    }

    /// Another store over the same map under a different namespace
    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            codec: self.codec.clone(),
            entries: Arc::clone(&self.entries),
        }
    }

    /// Encoded bytes stored under `key`
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.read().get(&qualify(&self.namespace, key)).cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StateStore for MemoryStore {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        check_key(key)?;
        self.raw(key)
            .map(|bytes| self.codec.decode(key, &bytes))
            .transpose()
    }

    fn set(&self, key: &str, record: &StateRecord) -> Result<()> {
        check_key(key)?;
        let bytes = self.codec.encode(record)?;
        self.write().insert(qualify(&self.namespace, key), bytes);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.write().remove(&qualify(&self.namespace, key));
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .read()
            .keys()
            .filter_map(|k| unqualify(&self.namespace, k))
            .map(str::to_string)
            .collect())
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
