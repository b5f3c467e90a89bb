//! Remote key-value map entity store.
//!
//! The wire client is abstracted behind [`KvTransport`], allowing
//! different remote stores (or a mock for testing) to back the same
//! [`RemoteMapStore`]. There is no local staging phase: prepare
//! buffers the batch in memory and commit performs one transport call
//! per affected entity, so prepare and commit coincide at the remote
//! store's own atomic put.
//!
//! Backends with native optimistic locking reject a conditional
//! update with [`StorageError::Conflict`] at commit time. That check
//! is independent of the version tracker in the transactional layer;
//! whichever detects a conflict first wins, and neither masks the
//! other.

use crate::config::RemoteConfig;
use crate::envelope;
use crate::error::{StorageError, StorageResult};
use crate::reference::{EntityReference, VersionToken};
use crate::store::{
    MapChange, MapChanger, MapEntityStore, StateCommitter, StateIter, StateSink,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Condition attached to a remote put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist.
    Absent,
    /// The key must exist with exactly this revision tag.
    Version(String),
    /// Unconditional write.
    Any,
}

/// A payload with the remote store's revision tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue {
    /// The stored payload text.
    pub payload: String,
    /// The remote store's revision tag for this payload.
    pub tag: String,
}

/// A remote key-value client.
///
/// Implement this trait to bind a concrete remote store. Calls are
/// synchronous and may block on the network; the transport owns
/// connection pooling and reconnection per its [`RemoteConfig`].
pub trait KvTransport: Send + Sync {
    /// Reads the value at `key`, or `None` if absent.
    fn get(&self, key: &str) -> StorageResult<Option<RemoteValue>>;

    /// Writes `payload` at `key` under the given condition, recording
    /// `new_tag` as the key's revision.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyExists` when [`Expect::Absent`] is violated
    /// and with `Conflict` when [`Expect::Version`] is.
    fn put(&self, key: &str, payload: &str, expect: &Expect, new_tag: &str) -> StorageResult<()>;

    /// Deletes the value at `key`. Returns `false` if it was absent.
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Returns every stored payload.
    ///
    /// Transports for stores that cannot enumerate their keyspace
    /// return [`StorageError::Unsupported`].
    fn scan(&self) -> StorageResult<Vec<String>>;
}

/// An in-memory [`KvTransport`] with conditional-put semantics.
///
/// Serves as the reference transport for tests; it behaves like a
/// remote store with native optimistic locking.
#[derive(Debug, Default)]
pub struct InMemoryKvTransport {
    entries: RwLock<HashMap<String, RemoteValue>>,
}

impl InMemoryKvTransport {
    /// Creates a new empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a key directly, bypassing conditions.
    ///
    /// Useful for simulating writes made by other clients.
    pub fn seed(&self, key: impl Into<String>, payload: impl Into<String>, tag: impl Into<String>) {
        self.entries.write().insert(
            key.into(),
            RemoteValue {
                payload: payload.into(),
                tag: tag.into(),
            },
        );
    }

    /// Returns the revision tag currently stored at `key`.
    #[must_use]
    pub fn tag_of(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).map(|value| value.tag.clone())
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns `true` if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvTransport for InMemoryKvTransport {
    fn get(&self, key: &str) -> StorageResult<Option<RemoteValue>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, payload: &str, expect: &Expect, new_tag: &str) -> StorageResult<()> {
        let mut entries = self.entries.write();
        let reference = EntityReference::new(key);
        match expect {
            Expect::Absent => {
                if entries.contains_key(key) {
                    return Err(StorageError::already_exists(&reference));
                }
            }
            Expect::Version(tag) => match entries.get(key) {
                None => return Err(StorageError::not_found(&reference)),
                Some(current) if &current.tag != tag => {
                    return Err(StorageError::conflict(&reference));
                }
                Some(_) => {}
            },
            Expect::Any => {}
        }
        entries.insert(
            key.to_owned(),
            RemoteValue {
                payload: payload.to_owned(),
                tag: new_tag.to_owned(),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn scan(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .values()
            .map(|value| value.payload.clone())
            .collect())
    }
}

/// A map entity store backed by a remote key-value service.
pub struct RemoteMapStore {
    transport: Arc<dyn KvTransport>,
    config: RemoteConfig,
}

impl RemoteMapStore {
    /// Creates a store over an established transport.
    pub fn new(transport: Arc<dyn KvTransport>, config: RemoteConfig) -> Self {
        debug!(
            "remote store bound to {:?} ({})",
            config.endpoints, config.store_name
        );
        Self { transport, config }
    }

    /// Returns the store's remote configuration.
    #[must_use]
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }
}

impl std::fmt::Debug for RemoteMapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMapStore")
            .field("endpoints", &self.config.endpoints)
            .field("store_name", &self.config.store_name)
            .finish_non_exhaustive()
    }
}

impl MapEntityStore for RemoteMapStore {
    fn fetch(&self, reference: &EntityReference) -> StorageResult<String> {
        match self.transport.get(reference.as_str())? {
            Some(value) => Ok(value.payload),
            None => Err(StorageError::not_found(reference)),
        }
    }

    fn apply_changes(
        &self,
        visit: &mut dyn FnMut(&mut dyn MapChanger) -> StorageResult<()>,
    ) -> StorageResult<Box<dyn StateCommitter>> {
        let staged = Arc::new(Mutex::new(Vec::new()));
        let mut changer = RemoteChanger {
            transport: Arc::clone(&self.transport),
            staged: Arc::clone(&staged),
        };
        visit(&mut changer)?;
        Ok(Box::new(RemoteCommitter {
            transport: Arc::clone(&self.transport),
            staged,
        }))
    }

    fn all_states(&self) -> StorageResult<StateIter> {
        let payloads = self.transport.scan()?;
        Ok(Box::new(payloads.into_iter().map(Ok)))
    }
}

enum RemoteOp {
    Create {
        reference: EntityReference,
        payload: String,
        tag: VersionToken,
    },
    Update {
        reference: EntityReference,
        payload: String,
        expected: VersionToken,
        tag: VersionToken,
    },
    Remove {
        reference: EntityReference,
    },
}

struct RemoteChanger {
    transport: Arc<dyn KvTransport>,
    staged: Arc<Mutex<Vec<RemoteOp>>>,
}

impl MapChanger for RemoteChanger {
    fn create(&mut self, reference: &EntityReference) -> StorageResult<Box<dyn StateSink>> {
        Ok(Box::new(RemoteSink {
            reference: reference.clone(),
            mode: Mode::Create,
            buffer: String::new(),
            transport: Arc::clone(&self.transport),
            staged: Arc::clone(&self.staged),
        }))
    }

    fn update(&mut self, change: &MapChange) -> StorageResult<Box<dyn StateSink>> {
        Ok(Box::new(RemoteSink {
            reference: change.reference.clone(),
            mode: Mode::Update {
                expected: change.previous_version.clone(),
                tag: change.new_version.clone(),
            },
            buffer: String::new(),
            transport: Arc::clone(&self.transport),
            staged: Arc::clone(&self.staged),
        }))
    }

    fn remove(&mut self, reference: &EntityReference) -> StorageResult<()> {
        if self.transport.get(reference.as_str())?.is_none() {
            return Err(StorageError::not_found(reference));
        }
        self.staged.lock().push(RemoteOp::Remove {
            reference: reference.clone(),
        });
        Ok(())
    }
}

enum Mode {
    Create,
    Update {
        expected: VersionToken,
        tag: VersionToken,
    },
}

struct RemoteSink {
    reference: EntityReference,
    mode: Mode,
    buffer: String,
    transport: Arc<dyn KvTransport>,
    staged: Arc<Mutex<Vec<RemoteOp>>>,
}

impl StateSink for RemoteSink {
    fn write(&mut self, chunk: &str) -> StorageResult<()> {
        self.buffer.push_str(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> StorageResult<()> {
        let exists = self.transport.get(self.reference.as_str())?.is_some();
        let op = match self.mode {
            Mode::Create => {
                if exists {
                    return Err(StorageError::already_exists(&self.reference));
                }
                let tag = envelope::envelope_version(&self.buffer)?;
                RemoteOp::Create {
                    reference: self.reference,
                    payload: self.buffer,
                    tag,
                }
            }
            Mode::Update { expected, tag } => {
                if !exists {
                    return Err(StorageError::not_found(&self.reference));
                }
                RemoteOp::Update {
                    reference: self.reference,
                    payload: self.buffer,
                    expected,
                    tag,
                }
            }
        };
        self.staged.lock().push(op);
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

struct RemoteCommitter {
    transport: Arc<dyn KvTransport>,
    staged: Arc<Mutex<Vec<RemoteOp>>>,
}

impl StateCommitter for RemoteCommitter {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        let staged: Vec<RemoteOp> = self.staged.lock().drain(..).collect();
        debug!("committing {} remote operations", staged.len());
        for op in staged {
            match op {
                RemoteOp::Create {
                    reference,
                    payload,
                    tag,
                } => {
                    self.transport.put(
                        reference.as_str(),
                        &payload,
                        &Expect::Absent,
                        tag.as_str(),
                    )?;
                }
                RemoteOp::Update {
                    reference,
                    payload,
                    expected,
                    tag,
                } => {
                    self.transport.put(
                        reference.as_str(),
                        &payload,
                        &Expect::Version(expected.as_str().to_owned()),
                        tag.as_str(),
                    )?;
                }
                RemoteOp::Remove { reference } => {
                    if !self.transport.delete(reference.as_str())? {
                        warn!("{} vanished before its staged removal", reference);
                    }
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

    fn store() -> (Arc<InMemoryKvTransport>, RemoteMapStore) {
        let transport = Arc::new(InMemoryKvTransport::new());
        let store = RemoteMapStore::new(
            Arc::clone(&transport) as Arc<dyn KvTransport>,
            RemoteConfig::default(),
        );
        (transport, store)
    }

    fn payload(reference: &str, version: &str) -> String {
        format!(r#"{{"reference":"{reference}","version":"{version}","value":{{}}}}"#)
    }

    fn change(reference: &EntityReference, previous: &str, new: &str) -> MapChange {
        MapChange {
            reference: reference.clone(),
            previous_version: VersionToken::new(previous),
            new_version: VersionToken::new(new),
            modified_millis: 0,
        }
    }

    #[test]
    fn create_commit_fetch_round_trip() {
        let (transport, store) = store();
        let reference = EntityReference::new("acct-1");
        let body = payload("acct-1", "v1");

        let committer = store
            .apply_changes(&mut |changer| {
                let mut sink = changer.create(&reference)?;
                sink.write(&body)?;
                sink.finish()
            })
            .unwrap();
        assert!(store.fetch(&reference).is_err());
        committer.commit().unwrap();

        assert_eq!(store.fetch(&reference).unwrap(), body);
        assert_eq!(transport.tag_of("acct-1").unwrap(), "v1");
    }

    #[test]
    fn create_existing_fails_at_staging() {
        let (transport, store) = store();
        transport.seed("acct-1", payload("acct-1", "v1"), "v1");
        let reference = EntityReference::new("acct-1");

        let result = store.apply_changes(&mut |changer| {
            let mut sink = changer.create(&reference)?;
            sink.write(&payload("acct-1", "v2"))?;
            sink.finish()
        });
        assert!(matches!(result, Err(StorageError::AlreadyExists { .. })));
    }

    #[test]
    fn conditional_update_surfaces_native_conflict() {
        let (transport, store) = store();
        transport.seed("acct-1", payload("acct-1", "v1"), "v1");
        let reference = EntityReference::new("acct-1");

        let committer = store
            .apply_changes(&mut |changer| {
                let mut sink = changer.update(&change(&reference, "v1", "v2"))?;
                sink.write(&payload("acct-1", "v2"))?;
                sink.finish()
            })
            .unwrap();

        // Another client wins the race before our commit.
        transport.seed("acct-1", payload("acct-1", "v9"), "v9");

        let result = committer.commit();
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        assert_eq!(transport.tag_of("acct-1").unwrap(), "v9");
    }

    #[test]
    fn update_missing_fails_at_staging() {
        let (_, store) = store();
        let reference = EntityReference::new("acct-1");

        let result = store.apply_changes(&mut |changer| {
            let mut sink = changer.update(&change(&reference, "v1", "v2"))?;
            sink.write(&payload("acct-1", "v2"))?;
            sink.finish()
        });
        assert!(matches!(result, Err(StorageError::NotFound { .. })));
    }

    #[test]
    fn remove_commits_deletion() {
        let (transport, store) = store();
        transport.seed("acct-1", payload("acct-1", "v1"), "v1");
        let reference = EntityReference::new("acct-1");

        let committer = store
            .apply_changes(&mut |changer| changer.remove(&reference))
            .unwrap();
        assert_eq!(transport.len(), 1);
        committer.commit().unwrap();
        assert!(transport.is_empty());
    }

    #[test]
    fn cancel_sends_nothing() {
        let (transport, store) = store();
        transport.seed("acct-1", payload("acct-1", "v1"), "v1");
        let existing = EntityReference::new("acct-1");
        let fresh = EntityReference::new("acct-2");

        let committer = store
            .apply_changes(&mut |changer| {
                let mut sink = changer.update(&change(&existing, "v1", "v2"))?;
                sink.write(&payload("acct-1", "v2"))?;
                sink.finish()?;
                let mut sink = changer.create(&fresh)?;
                sink.write(&payload("acct-2", "v2"))?;
                sink.finish()?;
                changer.remove(&existing)
            })
            .unwrap();

        committer.cancel();
        assert_eq!(store.fetch(&existing).unwrap(), payload("acct-1", "v1"));
        assert!(store.fetch(&fresh).is_err());
    }

    #[test]
    fn all_states_scans_transport() {
        let (transport, store) = store();
        transport.seed("a", payload("a", "v1"), "v1");
        transport.seed("b", payload("b", "v1"), "v1");

        let states: Vec<String> = store
            .all_states()
            .unwrap()
            .collect::<StorageResult<_>>()
            .unwrap();
        assert_eq!(states.len(), 2);
    }
}
