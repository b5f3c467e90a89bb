//! # OptiStore Storage
//!
//! Map entity store contract and storage backends for OptiStore.
//!
//! This crate defines the backend-neutral surface every storage engine
//! implements: fetch one entity's serialized state, stage a batch of
//! changes behind a two-phase committer, and stream every stored state
//! for backup or reindexing. Backends never interpret an entity's
//! attributes - they move opaque payload text keyed by
//! [`EntityReference`].
//!
//! ## Design Principles
//!
//! - Backends are keyed payload stores; the transactional layer owns
//!   all payload interpretation
//! - Staging is durable before anything becomes visible; `commit` flips
//!   visibility, `cancel` leaves no trace
//! - Must be `Send + Sync` for concurrent transactions
//!
//! ## Available Backends
//!
//! - [`MemoryMapStore`] - In-memory, for testing and as the contract
//!   reference implementation
//! - [`FileMapStore`] - Sharded local files with atomic rename
//! - [`RemoteMapStore`] - Remote key-value service behind a
//!   [`KvTransport`]
//!
//! ## Example
//!
//! ```rust
//! use optistore_storage::{EntityReference, MapEntityStore, MemoryMapStore};
//!
//! let store = MemoryMapStore::new();
//! let reference = EntityReference::new("acct-1");
//! assert!(store.fetch(&reference).is_err());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod envelope;
mod error;
mod file;
mod memory;
mod reference;
mod remote;
mod store;

pub use config::{open_store, FileStoreConfig, RemoteConfig, RemoteCredentials, StoreConfig};
pub use envelope::{
    envelope_reference, envelope_version, KEY_MODIFIED, KEY_REFERENCE, KEY_TYPE, KEY_VALUE,
    KEY_VERSION,
};
pub use error::{StorageError, StorageResult};
pub use file::FileMapStore;
pub use memory::MemoryMapStore;
pub use reference::{EntityReference, VersionToken};
pub use remote::{Expect, InMemoryKvTransport, KvTransport, RemoteMapStore, RemoteValue};
pub use store::{
    BackupRestore, MapChange, MapChanger, MapEntityStore, StateCommitter, StateIter, StateSink,
};
