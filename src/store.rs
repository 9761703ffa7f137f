//! State store selection from configuration

use crate::config::{Config, StoreKind};
use anyhow::{Context, Result};
use statekit::backends::{
    DurableStore, FsStore, HttpObjectClient, LocalProvisioner, MemoryStore, ObjectStore,
};
use statekit::{RecordCodec, StateStore};
use std::path::PathBuf;
use std::sync::Arc;

/// A concrete backend choice with its location resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSelector {
    Fs { root: PathBuf },
    Memory,
    Object {
        url: String,
        bucket: String,
        token: Option<String>,
    },
    Durable { journal: PathBuf },
}

impl StoreSelector {
    /// Resolve the `[state]` section of `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let state = &config.state;
        Ok(match state.backend {
            StoreKind::Fs => Self::Fs {
                root: state.resolved_dir()?,
            },
            StoreKind::Memory => Self::Memory,
            StoreKind::Object => Self::Object {
                url: state
                    .url
                    .clone()
                    .context("The object state backend needs a url")?,
                bucket: state.bucket.clone(),
                token: state.token.as_ref().map(|t| t.expose().to_string()),
            },
            StoreKind::Durable => Self::Durable {
                journal: state.resolved_dir()?.join("durable"),
            },
        })
    }

    /// Instantiate the selected backend; no I/O happens until the store's `init`
    pub fn open(&self, namespace: &str, codec: RecordCodec) -> Arc<dyn StateStore> {
        match self {
            Self::Fs { root } => {
                log::debug!("Using file state store at {}", root.display());
                Arc::new(FsStore::new(root.clone(), namespace, codec))
            }
            Self::Memory => {
                log::debug!("Using in-memory state store");
                Arc::new(MemoryStore::new(namespace, codec))
            }
            Self::Object { url, bucket, token } => {
                log::debug!("Using object state store at {url}/{bucket}");
                let mut client = HttpObjectClient::new(url.as_str(), bucket.as_str());
                if let Some(token) = token {
                    client = client.with_token(token.as_str());
                }
                Arc::new(ObjectStore::new(client, namespace, codec))
            }
            Self::Durable { journal } => {
                log::debug!("Using durable state store journaled to {}", journal.display());
                Arc::new(DurableStore::new(
                    LocalProvisioner::with_journal(journal.clone()),
                    namespace,
                    codec,
                ))
            }
        }
    }

    /// Resolve and open the store `config` describes
    pub fn build(config: &Config) -> Result<Arc<dyn StateStore>> {
        let selector = Self::from_config(config)?;
        let codec = config.codec()?;
        Ok(selector.open(&config.state.base_path, codec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;
    use statekit::{Secret, StateRecord, Value};
    use tempfile::TempDir;

    fn config(state: StateConfig) -> Config {
        Config {
            app: "shop".into(),
            stage: "dev".into(),
            state,
            ..Config::default()
        }
    }

    #[test]
    fn test_selector_from_config() {
        let fs = config(StateConfig {
            dir: Some("/srv/state".into()),
            ..StateConfig::default()
        });
        assert_eq!(
            StoreSelector::from_config(&fs).unwrap(),
            StoreSelector::Fs {
                root: PathBuf::from("/srv/state")
            }
        );

        let durable = config(StateConfig {
            backend: StoreKind::Durable,
            dir: Some("/srv/state".into()),
            ..StateConfig::default()
        });
        assert_eq!(
            StoreSelector::from_config(&durable).unwrap(),
            StoreSelector::Durable {
                journal: PathBuf::from("/srv/state/durable")
            }
        );

        let object = config(StateConfig {
            backend: StoreKind::Object,
            url: Some("http://localhost:9000".into()),
            token: Some(Secret::new("t0k")),
            ..StateConfig::default()
        });
        assert_eq!(
            StoreSelector::from_config(&object).unwrap(),
            StoreSelector::Object {
                url: "http://localhost:9000".into(),
                bucket: "stratum-state".into(),
                token: Some("t0k".into()),
            }
        );
    }

    #[test]
    fn test_object_without_url_fails() {
        let object = config(StateConfig {
            backend: StoreKind::Object,
            ..StateConfig::default()
        });
        assert!(StoreSelector::from_config(&object).is_err());
    }

    #[test]
    fn test_build_backends() {
        let dir = TempDir::new().unwrap();
        for (backend, name) in [
            (StoreKind::Fs, "fs"),
            (StoreKind::Memory, "memory"),
            (StoreKind::Durable, "durable"),
        ] {
            let store = StoreSelector::build(&config(StateConfig {
                backend,
                dir: Some(dir.path().to_string_lossy().into_owned()),
                base_path: "teams".into(),
                ..StateConfig::default()
            }))
            .unwrap();
            assert_eq!(store.backend(), name);
            assert_eq!(store.namespace(), "teams");
        }
    }

    #[test]
    fn test_built_store_encrypts_with_password() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(StateConfig {
            dir: Some(dir.path().to_string_lossy().into_owned()),
            ..StateConfig::default()
        });
        cfg.password = Some(Secret::new("pw"));
        let store = StoreSelector::build(&cfg).unwrap();
        let _session = statekit::session(store.as_ref()).unwrap();

        let mut record = StateRecord::new("shop/dev/db", "database", "db");
        record.props = Value::map([("password", Value::secret("hunter2"))]);
        store.set(&record.fqn, &record).unwrap();

        let loaded = store.get("shop/dev/db").unwrap().unwrap();
        let secret = loaded.props.get("password").and_then(Value::as_secret).unwrap();
        assert_eq!(secret.expose(), "hunter2");
    }
}
