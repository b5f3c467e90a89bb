//! # OptiStore Core
//!
//! Transactional entity persistence core for OptiStore.
//!
//! This crate provides:
//! - A per-transaction entity state cache ([`EntityStoreUnitOfWork`])
//!   with read-your-writes semantics
//! - Optimistic concurrency control via a shared [`VersionTracker`]
//!   that detects conflicts at commit time, without locking entities
//!   during a transaction's lifetime
//! - A two-phase commit protocol ([`Committer`]) that stages a change
//!   batch durably before anything becomes visible
//! - The [`EntityStore`] facade tying a storage backend to the tracker
//!
//! Storage backends implement the `MapEntityStore` contract from
//! [`optistore_storage`]; this crate is backend-agnostic.
//!
//! ## Error Handling
//!
//! Nothing in this layer recovers silently: every failure either
//! aborts the in-flight transaction, leaving durable state unchanged,
//! or is surfaced verbatim. Retrying after a
//! [`CoreError::ConcurrentModification`] is an explicit caller policy
//! (re-run the transaction body), never automatic.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod commit;
mod error;
mod state;
mod store;
mod uow;
mod version;

pub use commit::Committer;
pub use error::{CoreError, CoreResult};
pub use state::{EntityDescriptor, EntityState, EntityStatus};
pub use store::EntityStore;
pub use uow::{EntityStoreUnitOfWork, Usecase};
pub use version::VersionTracker;

// The storage-layer types that appear in this crate's API.
pub use optistore_storage::{EntityReference, MapEntityStore, StorageError, VersionToken};
