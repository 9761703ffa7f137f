//! Remote object storage backend
//!
//! Each record is one object at `<prefix>/<namespace>/<fqn>.json` in a bucket.
//! The transport is abstracted behind [`ObjectClient`] so the store logic can
//! be exercised without a network.

use crate::codec::RecordCodec;
use crate::error::{Error, Result};
use crate::record::StateRecord;
use crate::store::{StateStore, check_key};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

const SUFFIX: &str = ".json";

/// Minimal object storage operations needed by [`ObjectStore`]
pub trait ObjectClient: Send + Sync {
    /// Check that the bucket exists and is reachable
    fn head_bucket(&self) -> Result<()>;

    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put_object(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Delete an object; missing objects are not an error
    fn delete_object(&self, key: &str) -> Result<()>;

    /// Keys of all objects starting with `prefix`
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}

/// State store over an object storage bucket
#[derive(Debug)]
pub struct ObjectStore<C> {
    client: C,
    prefix: String,
    namespace: String,
    codec: RecordCodec,
}

impl<C: ObjectClient> ObjectStore<C> {
    pub fn new(client: C, namespace: impl Into<String>, codec: RecordCodec) -> Self {
        Self {
            client,
            prefix: String::new(),
            namespace: namespace.into(),
            codec,
        }
    }

    /// Place all objects under an additional key prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn base(&self) -> String {
        [self.prefix.as_str(), self.namespace.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("/")
    }

    fn object_key(&self, key: &str) -> Result<String> {
        check_key(key)?;
        let base = self.base();
        Ok(if base.is_empty() {
            format!("{key}{SUFFIX}")
        } else {
            format!("{base}/{key}{SUFFIX}")
        })
    }
}

impl<C: ObjectClient> StateStore for ObjectStore<C> {
    fn init(&self) -> Result<()> {
        self.client.head_bucket()
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        let object = self.object_key(key)?;
        self.client
            .get_object(&object)?
            .map(|bytes| self.codec.decode(key, &bytes))
            .transpose()
    }

    fn set(&self, key: &str, record: &StateRecord) -> Result<()> {
        let object = self.object_key(key)?;
        let bytes = self.codec.encode(record)?;
        self.client.put_object(&object, &bytes)?;
        log::debug!("Stored state object {object}");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let object = self.object_key(key)?;
        self.client.delete_object(&object)?;
        log::debug!("Deleted state object {object}");
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let base = self.base();
        let prefix = if base.is_empty() {
            String::new()
        } else {
            format!("{base}/")
        };

        let mut keys: Vec<String> = self
            .client
            .list_objects(&prefix)?
            .iter()
            .filter_map(|object| object.strip_prefix(&prefix)?.strip_suffix(SUFFIX))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        "object"
    }
}

// =============================================================================
// HTTP client
// =============================================================================

/// [`ObjectClient`] speaking a plain REST object API
///
/// - `GET|PUT|DELETE <endpoint>/<bucket>/<key>` for objects
/// - `HEAD <endpoint>/<bucket>` to check the bucket
/// - `GET <endpoint>/<bucket>?prefix=<p>` returning `{"keys": [..]}`
pub struct HttpObjectClient {
    agent: ureq::Agent,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    keys: Vec<String>,
}

impl HttpObjectClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{key}", self.bucket_url())
    }

    fn auth(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

impl std::fmt::Debug for HttpObjectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpObjectClient")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

fn is_not_found(err: &ureq::Error) -> bool {
    matches!(err, ureq::Error::StatusCode(404))
}

impl ObjectClient for HttpObjectClient {
    fn head_bucket(&self) -> Result<()> {
        let mut request = self.agent.head(self.bucket_url());
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", auth);
        }
        match request.call() {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(code)) => Err(Error::Http {
                message: format!("bucket '{}' is not accessible", self.bucket),
                status: Some(code),
            }),
            Err(e) => Err(Error::Unreachable(format!("{}: {e}", self.endpoint))),
        }
    }

    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut request = self.agent.get(self.object_url(key));
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", auth);
        }
        match request.call() {
            Ok(mut response) => Ok(Some(response.body_mut().read_to_vec()?)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_object(&self, key: &str, body: &[u8]) -> Result<()> {
        let mut request = self
            .agent
            .put(self.object_url(key))
            .header("Content-Type", "application/json");
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", auth);
        }
        request.send(body)?;
        Ok(())
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        let mut request = self.agent.delete(self.object_url(key));
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", auth);
        }
        match request.call() {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut request = self.agent.get(self.bucket_url()).query("prefix", prefix);
        if let Some(auth) = self.auth() {
            request = request.header("Authorization", auth);
        }
        let response: ListResponse = request.call()?.body_mut().read_json()?;
        Ok(response.keys)
    }
}

// =============================================================================
// In-process client
// =============================================================================

/// [`ObjectClient`] keeping objects in memory
#[derive(Debug)]
pub struct MemoryObjectClient {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    reachable: AtomicBool,
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self {
            objects: RwLock::default(),
            reachable: AtomicBool::new(true),
        }
    }
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the endpoint going away
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn object_keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    fn check(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unreachable("in-memory bucket offline".to_string()))
        }
    }

    fn objects(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<u8>>> {
        match self.objects.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn objects_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<u8>>> {
        match self.objects.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ObjectClient for MemoryObjectClient {
    fn head_bucket(&self) -> Result<()> {
        self.check()
    }

    fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.objects().get(key).cloned())
    }

    fn put_object(&self, key: &str, body: &[u8]) -> Result<()> {
        self.check()?;
        self.objects_mut().insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn delete_object(&self, key: &str) -> Result<()> {
        self.check()?;
        self.objects_mut().remove(key);
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
