//! Entity store facade.

use crate::error::CoreResult;
use crate::state::EntityState;
use crate::uow::{EntityStoreUnitOfWork, Usecase};
use crate::version::VersionTracker;
use optistore_storage::{envelope_version, EntityReference, MapEntityStore, VersionToken};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

/// Reads the authoritative current version of one entity straight
/// from the backend. A blocking point query, performed outside any
/// tracker lock.
pub(crate) fn probe_version(
    store: &dyn MapEntityStore,
    reference: &EntityReference,
) -> CoreResult<VersionToken> {
    let payload = store.fetch(reference)?;
    Ok(envelope_version(&payload)?)
}

/// The transactional entity store.
///
/// Ties a [`MapEntityStore`] backend to a shared [`VersionTracker`]
/// and opens units of work against the pair. Concurrent transactions
/// each get their own unit of work; the store itself is cheap to
/// share.
///
/// # Example
///
/// ```rust
/// use optistore_core::{EntityDescriptor, EntityStore, Usecase};
/// use optistore_storage::{EntityReference, MemoryMapStore};
/// use std::sync::Arc;
///
/// let store = EntityStore::new(Arc::new(MemoryMapStore::new()));
/// let mut uow = store.new_unit_of_work(Usecase::of("open account"));
/// uow.create_state(&EntityDescriptor::new("Account"), &EntityReference::new("acct-1"))?;
/// uow.complete()?.commit()?;
/// # Ok::<(), optistore_core::CoreError>(())
/// ```
pub struct EntityStore {
    store: Arc<dyn MapEntityStore>,
    versions: Arc<VersionTracker>,
}

impl EntityStore {
    /// Creates an entity store with a default-capacity version tracker.
    pub fn new(store: Arc<dyn MapEntityStore>) -> Self {
        Self::with_tracker(store, Arc::new(VersionTracker::default()))
    }

    /// Creates an entity store sharing an existing version tracker.
    pub fn with_tracker(store: Arc<dyn MapEntityStore>, versions: Arc<VersionTracker>) -> Self {
        Self { store, versions }
    }

    /// Begins a unit of work.
    ///
    /// The unit of work's identity and logical timestamp are fixed
    /// here; the timestamp serves the transaction's time-based
    /// queries and is stamped on everything it commits.
    pub fn new_unit_of_work(&self, usecase: Usecase) -> EntityStoreUnitOfWork {
        let identity = Uuid::new_v4().to_string();
        debug!("began unit of work {} ({})", identity, usecase);
        EntityStoreUnitOfWork::new(
            identity,
            usecase,
            now_millis(),
            Arc::clone(&self.store),
            Arc::clone(&self.versions),
        )
    }

    /// Returns the current durable version of one entity.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the reference has no durable state.
    pub fn version_of(&self, reference: &EntityReference) -> CoreResult<VersionToken> {
        probe_version(self.store.as_ref(), reference)
    }

    /// Streams every stored entity state, for backup, migration, or
    /// full reindex.
    ///
    /// An offline/maintenance feed over the backend's scan; no
    /// transactional consistency is implied.
    pub fn entity_states(
        &self,
    ) -> CoreResult<impl Iterator<Item = CoreResult<EntityState>> + Send> {
        let states = self.store.all_states()?;
        Ok(states.map(|payload| {
            let payload = payload?;
            EntityState::from_envelope(&payload)
        }))
    }

    /// Returns the shared version tracker.
    #[must_use]
    pub fn versions(&self) -> &Arc<VersionTracker> {
        &self.versions
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn map_store(&self) -> &Arc<dyn MapEntityStore> {
        &self.store
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("tracked_versions", &self.versions.len())
            .finish_non_exhaustive()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityDescriptor, EntityStatus};
    use optistore_storage::{MemoryMapStore, StorageError};
    use serde_json::json;

    fn entity_store() -> EntityStore {
        EntityStore::new(Arc::new(MemoryMapStore::new()))
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("Account")
    }

    fn create_account(store: &EntityStore, id: &str, balance: i64) {
        let mut uow = store.new_unit_of_work(Usecase::of("create account"));
        let state = uow
            .create_state(&descriptor(), &EntityReference::new(id))
            .unwrap();
        state.set_property("balance", json!(balance));
        uow.complete().unwrap().commit().unwrap();
    }

    #[test]
    fn commit_makes_state_visible_to_new_transactions() {
        let store = entity_store();
        create_account(&store, "acct-1", 100);

        let mut uow = store.new_unit_of_work(Usecase::default());
        let state = uow.state_for(&EntityReference::new("acct-1")).unwrap();
        assert_eq!(state.status(), EntityStatus::Loaded);
        assert_eq!(state.property("balance"), Some(&json!(100)));
        assert!(state.version().is_some());
    }

    #[test]
    fn cancelled_batch_is_invisible() {
        let store = entity_store();
        let reference = EntityReference::new("acct-1");

        let mut uow = store.new_unit_of_work(Usecase::default());
        uow.create_state(&descriptor(), &reference).unwrap();
        let committer = uow.complete().unwrap();
        committer.cancel();

        let mut fresh = store.new_unit_of_work(Usecase::default());
        assert!(fresh.state_for(&reference).is_err());
        // The tracker was never told about the cancelled write.
        assert!(store.versions().recorded(&reference).is_none());
    }

    #[test]
    fn concurrent_update_conflicts_with_full_reference_set() {
        let store = entity_store();
        create_account(&store, "acct-1", 100);
        create_account(&store, "acct-2", 100);

        // Both transactions load both accounts.
        let mut first = store.new_unit_of_work(Usecase::of("transfer"));
        first
            .state_for(&EntityReference::new("acct-1"))
            .unwrap()
            .set_property("balance", json!(150));
        first
            .state_for(&EntityReference::new("acct-2"))
            .unwrap();

        let mut second = store.new_unit_of_work(Usecase::of("interest"));
        second
            .state_for(&EntityReference::new("acct-1"))
            .unwrap()
            .set_property("balance", json!(200));
        second.complete().unwrap().commit().unwrap();

        // Only acct-1 was modified concurrently; acct-2 stayed clean.
        let result = first.complete();
        match result {
            Err(crate::CoreError::ConcurrentModification { references }) => {
                assert_eq!(references, vec![EntityReference::new("acct-1")]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The winning write survived.
        let mut reader = store.new_unit_of_work(Usecase::default());
        let state = reader.state_for(&EntityReference::new("acct-1")).unwrap();
        assert_eq!(state.property("balance"), Some(&json!(200)));
    }

    #[test]
    fn conflict_detection_survives_tracker_eviction() {
        let backend = Arc::new(MemoryMapStore::new());
        let store =
            EntityStore::with_tracker(Arc::clone(&backend) as _, Arc::new(VersionTracker::new(1)));
        create_account(&store, "acct-1", 100);

        let mut writer = store.new_unit_of_work(Usecase::default());
        writer
            .state_for(&EntityReference::new("acct-1"))
            .unwrap()
            .set_property("balance", json!(150));

        // Push the record out of the bounded tracker.
        create_account(&store, "acct-2", 0);
        create_account(&store, "acct-3", 0);
        assert!(store
            .versions()
            .recorded(&EntityReference::new("acct-1"))
            .is_none());

        // Eviction must force a probe, not a spurious conflict.
        writer.complete().unwrap().commit().unwrap();
    }

    #[test]
    fn removal_forgets_tracked_version() {
        let store = entity_store();
        create_account(&store, "acct-1", 100);
        let reference = EntityReference::new("acct-1");
        assert!(store.versions().recorded(&reference).is_some());

        let mut uow = store.new_unit_of_work(Usecase::of("close account"));
        uow.state_for(&reference).unwrap().mark_removed();
        uow.complete().unwrap().commit().unwrap();

        assert!(store.versions().recorded(&reference).is_none());
        let mut fresh = store.new_unit_of_work(Usecase::default());
        assert!(matches!(
            fresh.state_for(&reference),
            Err(crate::CoreError::Storage(StorageError::NotFound { .. }))
        ));
    }

    #[test]
    fn version_advances_with_every_commit() {
        let store = entity_store();
        create_account(&store, "acct-1", 100);
        let reference = EntityReference::new("acct-1");
        let first = store.version_of(&reference).unwrap();

        let mut uow = store.new_unit_of_work(Usecase::default());
        uow.state_for(&reference)
            .unwrap()
            .set_property("balance", json!(150));
        uow.complete().unwrap().commit().unwrap();

        let second = store.version_of(&reference).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn entity_states_streams_every_entity() {
        let store = entity_store();
        create_account(&store, "acct-1", 1);
        create_account(&store, "acct-2", 2);
        create_account(&store, "acct-3", 3);

        let mut references: Vec<String> = store
            .entity_states()
            .unwrap()
            .map(|state| state.unwrap().reference().as_str().to_owned())
            .collect();
        references.sort();
        assert_eq!(references, vec!["acct-1", "acct-2", "acct-3"]);
    }
}
