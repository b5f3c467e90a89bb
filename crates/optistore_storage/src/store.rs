//! Map entity store contract.

use crate::error::StorageResult;
use crate::reference::{EntityReference, VersionToken};

/// Metadata for one entity update inside a change batch.
///
/// Backends with native optimistic locking use [`previous_version`] for
/// a conditional write; backends without it may ignore everything but
/// the reference.
///
/// [`previous_version`]: MapChange::previous_version
#[derive(Debug, Clone)]
pub struct MapChange {
    /// The entity being updated.
    pub reference: EntityReference,
    /// The version token the transaction loaded.
    pub previous_version: VersionToken,
    /// The version token the staged payload carries.
    pub new_version: VersionToken,
    /// Last-modified time stamped into the payload, epoch milliseconds.
    pub modified_millis: u64,
}

/// A write target for one entity's serialized state.
///
/// The caller fills the sink with payload text and then calls
/// [`finish`], which is the moment the backend durably stages the
/// write. [`abort`] releases the sink's resources with no durable
/// effect. Every sink must end in exactly one of the two.
///
/// [`finish`]: StateSink::finish
/// [`abort`]: StateSink::abort
pub trait StateSink {
    /// Appends a chunk of payload text.
    fn write(&mut self, chunk: &str) -> StorageResult<()>;

    /// Durably stages the buffered payload.
    ///
    /// For a create, fails with `AlreadyExists` if durable state
    /// already occupies the reference; for an update, fails with
    /// `NotFound` if none does.
    fn finish(self: Box<Self>) -> StorageResult<()>;

    /// Discards the buffered payload and releases resources.
    fn abort(self: Box<Self>);
}

/// Per-batch change visitor handed to the caller by
/// [`MapEntityStore::apply_changes`].
pub trait MapChanger {
    /// Opens a sink for a brand-new entity.
    fn create(&mut self, reference: &EntityReference) -> StorageResult<Box<dyn StateSink>>;

    /// Opens a sink replacing an existing entity's state.
    fn update(&mut self, change: &MapChange) -> StorageResult<Box<dyn StateSink>>;

    /// Stages the removal of an existing entity.
    ///
    /// Fails with `NotFound` if the reference has no durable state.
    fn remove(&mut self, reference: &EntityReference) -> StorageResult<()>;
}

/// Second phase of the commit handshake.
///
/// Returned by [`MapEntityStore::apply_changes`] once the whole batch
/// is staged. Nothing staged is visible to other transactions until
/// [`commit`] returns; [`cancel`] guarantees no partial visibility.
///
/// [`commit`]: StateCommitter::commit
/// [`cancel`]: StateCommitter::cancel
pub trait StateCommitter: Send {
    /// Makes the staged batch visible.
    fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards the staged batch.
    fn cancel(self: Box<Self>);
}

/// A lazy sequence of stored payloads.
///
/// Finite and not restartable; a fresh call to the producing method
/// re-scans from the start. Concurrent mutation yields at best a
/// reasonable snapshot.
pub type StateIter = Box<dyn Iterator<Item = StorageResult<String>> + Send>;

/// The backend-neutral surface every storage backend implements.
///
/// # Invariants
///
/// - `fetch` returns exactly the payload most recently committed for
///   that reference
/// - `apply_changes` stages the batch durably before returning; only
///   the returned committer's `commit` makes it visible
/// - Implementations must be `Send + Sync`; calls may block on I/O
///
/// # Implementors
///
/// - [`crate::MemoryMapStore`] - For testing
/// - [`crate::FileMapStore`] - Sharded local files
/// - [`crate::RemoteMapStore`] - Remote key-value service
pub trait MapEntityStore: Send + Sync {
    /// Returns the durable payload of one entity.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the reference has no durable state.
    fn fetch(&self, reference: &EntityReference) -> StorageResult<String>;

    /// Stages a batch of changes and returns its committer.
    ///
    /// The store drives the caller's closure with a [`MapChanger`]; the
    /// closure opens one sink (or removal) per affected entity. When
    /// the closure returns, every change is durably staged and the
    /// returned [`StateCommitter`] flips visibility or discards.
    ///
    /// # Errors
    ///
    /// Any staging failure aborts the batch before any visibility
    /// change; retrying with a fresh batch is safe.
    fn apply_changes(
        &self,
        visit: &mut dyn FnMut(&mut dyn MapChanger) -> StorageResult<()>,
    ) -> StorageResult<Box<dyn StateCommitter>>;

    /// Streams every stored entity's payload.
    ///
    /// An offline/maintenance operation for backup, migration, or full
    /// reindex; no cross-backend consistency guarantee.
    fn all_states(&self) -> StorageResult<StateIter>;
}

/// Whole-store backup and restore.
///
/// The stream consists of whole payload envelopes, one per entity,
/// each self-describing its own reference so restore can route it
/// without external metadata.
pub trait BackupRestore {
    /// Streams every stored payload.
    fn backup(&self) -> StorageResult<StateIter>;

    /// Writes payloads back into the store, routing each by the
    /// reference inside its envelope. Existing entries are overwritten.
    /// Returns the number of payloads restored.
    fn restore(&self, states: &mut dyn Iterator<Item = String>) -> StorageResult<usize>;
}
