//! Shared on-disk/on-wire format for state records
//!
//! Every backend stores records in this format so state can be moved between
//! backends. Non-secret data is readable JSON; each secret is sealed individually
//! and stored as `{"@secret": "<sealed>"}`. Map keys written by users that
//! start with `@` are stored with one more leading `@`, so a single-`@` key is
//! always a codec tag.

use crate::error::{Error, Result};
use crate::record::{ResourceStatus, StateRecord};
use crate::secret::SecretCodec;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SECRET_TAG: &str = "@secret";
const TAG_PREFIX: char = '@';

#[derive(Debug, Serialize, Deserialize)]
struct RecordDoc {
    fqn: String,
    kind: String,
    id: String,
    seq: u64,
    status: ResourceStatus,
    props: serde_json::Value,
    output: serde_json::Value,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Encodes and decodes records, sealing secrets when a passphrase is configured
#[derive(Debug, Clone, Default)]
pub struct RecordCodec {
    secrets: Option<Arc<SecretCodec>>,
}

impl RecordCodec {
    /// Codec that seals secrets with the given secret codec
    pub fn new(secrets: SecretCodec) -> Self {
        Self {
            secrets: Some(Arc::new(secrets)),
        }
    }

    /// Codec without a passphrase; records containing secrets are rejected
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn has_passphrase(&self) -> bool {
        self.secrets.is_some()
    }

    pub fn encode(&self, record: &StateRecord) -> Result<Vec<u8>> {
        let doc = RecordDoc {
            fqn: record.fqn.clone(),
            kind: record.kind.clone(),
            id: record.id.clone(),
            seq: record.seq,
            status: record.status,
            props: self.to_json(&record.props)?,
            output: self.to_json(&record.output)?,
            deps: record.deps.clone(),
            message: record.message.clone(),
            updated_at: record.updated_at,
        };
        Ok(serde_json::to_vec_pretty(&doc)?)
    }

    pub fn decode(&self, key: &str, bytes: &[u8]) -> Result<StateRecord> {
        let doc: RecordDoc = serde_json::from_slice(bytes).map_err(|e| Error::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(StateRecord {
            props: self.from_json(doc.props).map_err(|e| e.for_key(key))?,
            output: self.from_json(doc.output).map_err(|e| e.for_key(key))?,
            fqn: doc.fqn,
            kind: doc.kind,
            id: doc.id,
            seq: doc.seq,
            status: doc.status,
            deps: doc.deps,
            message: doc.message,
            updated_at: doc.updated_at,
        })
    }

    fn to_json(&self, value: &Value) -> Result<serde_json::Value> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|v| self.to_json(v))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| Ok((escape_key(k), self.to_json(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Secret(secret) => {
                let codec = self.secrets.as_ref().ok_or(Error::MissingPassphrase)?;
                let mut tagged = serde_json::Map::new();
                tagged.insert(
                    SECRET_TAG.to_string(),
                    serde_json::Value::String(codec.seal(secret)?),
                );
                serde_json::Value::Object(tagged)
            }
            Value::Ref(r) => {
                return Err(Error::UnresolvedBinding {
                    fqn: r.fqn.clone(),
                    path: r.path.clone(),
                });
            }
        })
    }

    fn from_json(&self, json: serde_json::Value) -> Result<Value> {
        Ok(match json {
            serde_json::Value::Object(m) if m.len() == 1 && sealed_secret(&m).is_some() => {
                let codec = self.secrets.as_ref().ok_or(Error::MissingPassphrase)?;
                let sealed = sealed_secret(&m).unwrap_or_default();
                Value::Secret(codec.open(sealed)?)
            }
            serde_json::Value::Object(m) => Value::Map(
                m.into_iter()
                    .map(|(k, v)| Ok((unescape_key(k), self.from_json(v)?)))
                    .collect::<Result<_>>()?,
            ),
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| self.from_json(v))
                    .collect::<Result<_>>()?,
            ),
            other => Value::from_json(other),
        })
    }
}

fn escape_key(key: &str) -> String {
    if key.starts_with(TAG_PREFIX) {
        format!("{TAG_PREFIX}{key}")
    } else {
        key.to_string()
    }
}

fn unescape_key(key: String) -> String {
    match key.strip_prefix(TAG_PREFIX) {
        Some(rest) if rest.starts_with(TAG_PREFIX) => rest.to_string(),
        _ => key,
    }
}

fn sealed_secret(m: &serde_json::Map<String, serde_json::Value>) -> Option<&str> {
    m.get(SECRET_TAG).and_then(serde_json::Value::as_str)
}
