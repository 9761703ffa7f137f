//! Storage backends implementing [`StateStore`](crate::StateStore)
//!
//! All backends share the record format of [`RecordCodec`](crate::RecordCodec),
//! so state can be migrated between them with [`migrate`](crate::migrate).

mod durable;
mod fs;
mod memory;
mod object;

pub use durable::{DurableStore, LocalProvisioner, Provisioner, WorkerHandle, WorkerRequest};
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use object::{HttpObjectClient, MemoryObjectClient, ObjectClient, ObjectStore};
