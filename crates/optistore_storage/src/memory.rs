//! In-memory map entity store for testing.

use crate::envelope;
use crate::error::{StorageError, StorageResult};
use crate::reference::EntityReference;
use crate::store::{
    BackupRestore, MapChange, MapChanger, MapEntityStore, StateCommitter, StateIter, StateSink,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// An in-memory map entity store.
///
/// This backend keeps all payloads in a process-local map and is
/// suitable for:
/// - Unit tests
/// - The reference implementation of the contract's staging semantics
///
/// Staged batches are buffered in the committer, so nothing touches
/// the shared map until `commit`.
///
/// # Thread Safety
///
/// The store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use optistore_storage::{EntityReference, MapEntityStore, MemoryMapStore};
///
/// let store = MemoryMapStore::with_entries([("acct-1", "{\"reference\":\"acct-1\"}")]);
/// let payload = store.fetch(&EntityReference::new("acct-1")).unwrap();
/// assert!(payload.contains("acct-1"));
/// ```
#[derive(Debug, Default)]
pub struct MemoryMapStore {
    entries: Arc<RwLock<HashMap<EntityReference, String>>>,
}

enum StagedOp {
    Put {
        reference: EntityReference,
        payload: String,
    },
    Remove {
        reference: EntityReference,
    },
}

impl MemoryMapStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with payloads.
    ///
    /// Useful for testing load and restore scenarios.
    pub fn with_entries<R, P>(entries: impl IntoIterator<Item = (R, P)>) -> Self
    where
        R: Into<EntityReference>,
        P: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(reference, payload)| (reference.into(), payload.into()))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(map)),
        }
    }

    /// Returns the number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if the store holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns `true` if durable state exists for the reference.
    #[must_use]
    pub fn contains(&self, reference: &EntityReference) -> bool {
        self.entries.read().contains_key(reference)
    }
}

impl MapEntityStore for MemoryMapStore {
    fn fetch(&self, reference: &EntityReference) -> StorageResult<String> {
        self.entries
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::not_found(reference))
    }

    fn apply_changes(
        &self,
        visit: &mut dyn FnMut(&mut dyn MapChanger) -> StorageResult<()>,
    ) -> StorageResult<Box<dyn StateCommitter>> {
        let staged = Arc::new(Mutex::new(Vec::new()));
        let mut changer = MemoryChanger {
            entries: Arc::clone(&self.entries),
            staged: Arc::clone(&staged),
        };
        visit(&mut changer)?;
        Ok(Box::new(MemoryCommitter {
            entries: Arc::clone(&self.entries),
            staged,
        }))
    }

    fn all_states(&self) -> StorageResult<StateIter> {
        let snapshot: Vec<String> = self.entries.read().values().cloned().collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

impl BackupRestore for MemoryMapStore {
    fn backup(&self) -> StorageResult<StateIter> {
        self.all_states()
    }

    fn restore(&self, states: &mut dyn Iterator<Item = String>) -> StorageResult<usize> {
        let mut restored = 0;
        let mut entries = self.entries.write();
        for payload in states {
            let reference = envelope::envelope_reference(&payload)?;
            entries.insert(reference, payload);
            restored += 1;
        }
        Ok(restored)
    }
}

struct MemoryChanger {
    entries: Arc<RwLock<HashMap<EntityReference, String>>>,
    staged: Arc<Mutex<Vec<StagedOp>>>,
}

impl MapChanger for MemoryChanger {
    fn create(&mut self, reference: &EntityReference) -> StorageResult<Box<dyn StateSink>> {
        Ok(Box::new(MemorySink {
            reference: reference.clone(),
            must_exist: false,
            buffer: String::new(),
            entries: Arc::clone(&self.entries),
            staged: Arc::clone(&self.staged),
        }))
    }

    fn update(&mut self, change: &MapChange) -> StorageResult<Box<dyn StateSink>> {
        Ok(Box::new(MemorySink {
            reference: change.reference.clone(),
            must_exist: true,
            buffer: String::new(),
            entries: Arc::clone(&self.entries),
            staged: Arc::clone(&self.staged),
        }))
    }

    fn remove(&mut self, reference: &EntityReference) -> StorageResult<()> {
        if !self.entries.read().contains_key(reference) {
            return Err(StorageError::not_found(reference));
        }
        self.staged.lock().push(StagedOp::Remove {
            reference: reference.clone(),
        });
        Ok(())
    }
}

struct MemorySink {
    reference: EntityReference,
    must_exist: bool,
    buffer: String,
    entries: Arc<RwLock<HashMap<EntityReference, String>>>,
    staged: Arc<Mutex<Vec<StagedOp>>>,
}

impl StateSink for MemorySink {
    fn write(&mut self, chunk: &str) -> StorageResult<()> {
        self.buffer.push_str(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> StorageResult<()> {
        let exists = self.entries.read().contains_key(&self.reference);
        if self.must_exist && !exists {
            return Err(StorageError::not_found(&self.reference));
        }
        if !self.must_exist && exists {
            return Err(StorageError::already_exists(&self.reference));
        }
        self.staged.lock().push(StagedOp::Put {
            reference: self.reference,
            payload: self.buffer,
        });
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

struct MemoryCommitter {
    entries: Arc<RwLock<HashMap<EntityReference, String>>>,
    staged: Arc<Mutex<Vec<StagedOp>>>,
}

impl StateCommitter for MemoryCommitter {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let staged: Vec<StagedOp> = self.staged.lock().drain(..).collect();
        let mut entries = self.entries.write();
        for op in staged {
            match op {
                StagedOp::Put { reference, payload } => {
                    entries.insert(reference, payload);
                }
                StagedOp::Remove { reference } => {
                    entries.remove(&reference);
                }
            }
        }
        Ok(())
    }

    fn cancel(self: Box<Self>) {
        self.staged.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::VersionToken;

    fn change(reference: &EntityReference) -> MapChange {
        MapChange {
            reference: reference.clone(),
            previous_version: VersionToken::new("v1"),
            new_version: VersionToken::new("v2"),
            modified_millis: 0,
        }
    }

    #[test]
    fn fetch_missing_fails() {
        let store = MemoryMapStore::new();
        let result = store.fetch(&EntityReference::new("missing"));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn create_not_visible_until_commit() {
        let store = MemoryMapStore::new();
        let reference = EntityReference::new("acct-1");

        let committer = store
            .apply_changes(&mut |changer| {
                let mut sink = changer.create(&reference)?;
                sink.write("{\"reference\":\"acct-1\"}")?;
                sink.finish()
            })
            .unwrap();

        assert!(store.fetch(&reference).is_err());
        committer.commit().unwrap();
        assert!(store.fetch(&reference).is_ok());
    }

    #[test]
    fn create_existing_fails_at_staging() {
        let store = MemoryMapStore::with_entries([("acct-1", "{}")]);
        let reference = EntityReference::new("acct-1");

        let result = store.apply_changes(&mut |changer| {
            let mut sink = changer.create(&reference)?;
            sink.write("{}")?;
            sink.finish()
        });
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
    }

    #[test]
    fn update_missing_fails_at_staging() {
        let store = MemoryMapStore::new();
        let reference = EntityReference::new("acct-1");

        let result = store.apply_changes(&mut |changer| {
            let mut sink = changer.update(&change(&reference))?;
            sink.write("{}")?;
            sink.finish()
        });
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn remove_missing_fails_at_staging() {
        let store = MemoryMapStore::new();
        let reference = EntityReference::new("acct-1");

        let result = store.apply_changes(&mut |changer| changer.remove(&reference));
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn cancel_leaves_no_trace() {
        let store = MemoryMapStore::with_entries([("acct-1", "old")]);
        let existing = EntityReference::new("acct-1");
        let fresh = EntityReference::new("acct-2");

        let committer = store
            .apply_changes(&mut |changer| {
                let mut sink = changer.update(&change(&existing))?;
                sink.write("new")?;
                sink.finish()?;
                let mut sink = changer.create(&fresh)?;
                sink.write("{}")?;
                sink.finish()?;
                changer.remove(&existing)
            })
            .unwrap();

        committer.cancel();
        assert_eq!(store.fetch(&existing).unwrap(), "old");
        assert!(store.fetch(&fresh).is_err());
    }

    #[test]
    fn remove_applies_on_commit() {
        let store = MemoryMapStore::with_entries([("acct-1", "{}")]);
        let reference = EntityReference::new("acct-1");

        let committer = store
            .apply_changes(&mut |changer| changer.remove(&reference))
            .unwrap();
        assert!(store.contains(&reference));

        committer.commit().unwrap();
        assert!(!store.contains(&reference));
    }

    #[test]
    fn all_states_snapshots_committed_payloads() {
        let store = MemoryMapStore::with_entries([("a", "1"), ("b", "2")]);
        let mut payloads: Vec<String> = store
            .all_states()
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        payloads.sort();
        assert_eq!(payloads, vec!["1", "2"]);
    }

    #[test]
    fn restore_routes_by_envelope_reference() {
        let store = MemoryMapStore::new();
        let payloads = vec![
            r#"{"reference":"acct-1","version":"v1"}"#.to_string(),
            r#"{"reference":"acct-2","version":"v1"}"#.to_string(),
        ];

        let restored = store.restore(&mut payloads.into_iter()).unwrap();
        assert_eq!(restored, 2);
        assert!(store.contains(&EntityReference::new("acct-1")));
        assert!(store.contains(&EntityReference::new("acct-2")));
    }
}
