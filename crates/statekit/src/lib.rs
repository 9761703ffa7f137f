//! Persistent resource state
//!
//! This crate provides the storage layer of the engine:
//!
//! - [`Value`]: structured props and outputs, including [`Secret`] scalars and
//!   unresolved [`OutputRef`] bindings
//! - [`SecretCodec`]: passphrase-keyed sealing of secret values
//! - [`StateRecord`]: the persisted form of a resource
//! - [`RecordCodec`]: the record format shared by every backend
//! - [`StateStore`]: the backend contract, with file tree, in-memory, object
//!   storage and actor-backed implementations in [`backends`]
//!
//! # Example
//!
//! ```
//! use statekit::backends::MemoryStore;
//! use statekit::{Passphrase, RecordCodec, SecretCodec, StateRecord, StateStore, Value};
//!
//! let codec = RecordCodec::new(SecretCodec::new(Passphrase::new("pw")).unwrap());
//! let store = MemoryStore::new("shop", codec);
//!
//! let mut record = StateRecord::new("shop/dev/db", "database", "db");
//! record.props = Value::map([("password", Value::secret("hunter2"))]);
//! store.set(&record.fqn, &record).unwrap();
//!
//! let loaded = store.get("shop/dev/db").unwrap().unwrap();
//! let password = loaded.props.get("password").and_then(Value::as_secret).unwrap();
//! assert_eq!(password.to_string(), "***REDACTED***");
//! assert_eq!(password.expose(), "hunter2");
//! ```

pub mod backends;
mod codec;
mod error;
mod record;
mod secret;
mod store;
mod value;

pub use codec::RecordCodec;
pub use error::{Error, Result};
pub use record::{ResourceStatus, StateRecord};
pub use secret::{Passphrase, Secret, SecretCodec};
pub use store::{StateStore, StoreSession, check_key, migrate, session};
pub use value::{OutputRef, Value};
