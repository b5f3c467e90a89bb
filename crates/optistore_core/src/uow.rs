//! Per-transaction entity state cache.

use crate::commit::Committer;
use crate::error::{CoreError, CoreResult};
use crate::state::{EntityDescriptor, EntityState, EntityStatus};
use crate::store::probe_version;
use crate::version::VersionTracker;
use optistore_storage::{
    EntityReference, MapChange, MapEntityStore, StorageError, VersionToken,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Intended-use label of a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usecase(String);

impl Usecase {
    /// Creates a usecase label.
    pub fn of(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for Usecase {
    fn default() -> Self {
        Self::of("default")
    }
}

impl fmt::Display for Usecase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One transaction's view of the entity store.
///
/// Caches every entity state the transaction creates or loads, keyed
/// by reference, so a reference resolves to the same state object for
/// the whole transaction (read-your-writes). The cache is confined to
/// one transaction; it needs no internal synchronization and must not
/// be shared across threads.
///
/// A unit of work ends in exactly one of two ways: [`complete`], which
/// hands the change batch to the commit protocol, or [`discard`]
/// (implicit on drop), which has no durable effect.
///
/// [`complete`]: EntityStoreUnitOfWork::complete
/// [`discard`]: EntityStoreUnitOfWork::discard
pub struct EntityStoreUnitOfWork {
    identity: String,
    usecase: Usecase,
    current_time_millis: u64,
    states: HashMap<EntityReference, EntityState>,
    store: Arc<dyn MapEntityStore>,
    versions: Arc<VersionTracker>,
}

enum StagedChange {
    Create(EntityState),
    Update(EntityState, VersionToken),
    Remove(EntityReference),
}

impl EntityStoreUnitOfWork {
    pub(crate) fn new(
        identity: String,
        usecase: Usecase,
        current_time_millis: u64,
        store: Arc<dyn MapEntityStore>,
        versions: Arc<VersionTracker>,
    ) -> Self {
        Self {
            identity,
            usecase,
            current_time_millis,
            states: HashMap::new(),
            store,
            versions,
        }
    }

    /// Returns the unit of work's unique identity.
    ///
    /// Doubles as the version token stamped on every state this unit
    /// of work commits.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the intended-use label.
    #[must_use]
    pub fn usecase(&self) -> &Usecase {
        &self.usecase
    }

    /// Returns the logical timestamp fixed at transaction start,
    /// epoch milliseconds.
    #[must_use]
    pub fn current_time_millis(&self) -> u64 {
        self.current_time_millis
    }

    /// Returns the number of cached entity states.
    #[must_use]
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Creates a fresh entity state for `reference`.
    ///
    /// No durable side effect occurs here; durability is deferred to
    /// commit.
    ///
    /// # Errors
    ///
    /// Fails with `AlreadyExists` if the reference is already cached
    /// in this transaction, whether created or loaded.
    pub fn create_state(
        &mut self,
        descriptor: &EntityDescriptor,
        reference: &EntityReference,
    ) -> CoreResult<&mut EntityState> {
        if self.states.contains_key(reference) {
            return Err(StorageError::already_exists(reference).into());
        }
        let state =
            EntityState::new_state(reference.clone(), descriptor, self.current_time_millis);
        Ok(self.states.entry(reference.clone()).or_insert(state))
    }

    /// Returns the entity state for `reference`, loading it from the
    /// backend on first access.
    ///
    /// Repeated calls within the transaction return the identical
    /// cached state, so every mutation is visible to every later read.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if the reference has no durable state.
    pub fn state_for(&mut self, reference: &EntityReference) -> CoreResult<&mut EntityState> {
        if !self.states.contains_key(reference) {
            let payload = self.store.fetch(reference)?;
            let state = EntityState::from_envelope(&payload)?;
            self.states.insert(reference.clone(), state);
        }
        self.states
            .get_mut(reference)
            .ok_or_else(|| StorageError::not_found(reference).into())
    }

    /// Returns the version token for `reference` without caching.
    ///
    /// A cached state answers directly; otherwise the backend is
    /// probed. Used for read-only conflict pre-checks on entities the
    /// transaction does not otherwise touch.
    ///
    /// # Errors
    ///
    /// Fails with `NotFound` if no durable version exists; a state
    /// created in this transaction has none yet.
    pub fn version_of(&self, reference: &EntityReference) -> CoreResult<VersionToken> {
        match self.states.get(reference) {
            Some(state) => state
                .version()
                .cloned()
                .ok_or_else(|| StorageError::not_found(reference).into()),
            None => probe_version(self.store.as_ref(), reference),
        }
    }

    /// Completes the unit of work: checks for concurrent modification,
    /// stages the change batch, and returns its [`Committer`].
    ///
    /// The batch holds every created, updated, and removed state;
    /// loaded-but-unmodified states are excluded, and a state both
    /// created and removed in this transaction is dropped entirely.
    /// The batch is consumed exactly once by the returned committer.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConcurrentModification`] with the full conflict
    /// set if any captured version no longer matches the durable one;
    /// storage errors from staging. Either way nothing became visible
    /// and durable state is unchanged.
    pub fn complete(mut self) -> CoreResult<Committer> {
        let mut candidates = Vec::new();
        let mut staged = Vec::new();
        let mut remember = Vec::new();
        let mut forget = Vec::new();
        let new_version = VersionToken::new(self.identity.clone());

        for (_, state) in self.states.drain() {
            let captured = state.version().cloned();
            match state.status() {
                EntityStatus::Loaded => {}
                EntityStatus::New => {
                    remember.push((state.reference().clone(), new_version.clone()));
                    staged.push(StagedChange::Create(state));
                }
                EntityStatus::Updated => {
                    let captured = captured.ok_or_else(|| {
                        CoreError::invalid_operation("updated state lacks a version token")
                    })?;
                    candidates.push((state.reference().clone(), captured.clone()));
                    remember.push((state.reference().clone(), new_version.clone()));
                    staged.push(StagedChange::Update(state, captured));
                }
                EntityStatus::Removed => {
                    // Created and removed in the same transaction: no
                    // durable counterpart, nothing to stage.
                    let Some(captured) = captured else { continue };
                    candidates.push((state.reference().clone(), captured));
                    forget.push(state.reference().clone());
                    staged.push(StagedChange::Remove(state.reference().clone()));
                }
            }
        }

        let store = Arc::clone(&self.store);
        self.versions
            .check_conflicts(&candidates, |reference| {
                probe_version(store.as_ref(), reference)
            })?;

        debug!(
            "completing unit of work {} ({}): {} changes",
            self.identity,
            self.usecase,
            staged.len()
        );

        let modified = self.current_time_millis;
        let inner = self.store.apply_changes(&mut |changer| {
            for change in &staged {
                match change {
                    StagedChange::Create(state) => {
                        let mut sink = changer.create(state.reference())?;
                        sink.write(&state.to_envelope(&new_version, modified))?;
                        sink.finish()?;
                    }
                    StagedChange::Update(state, previous) => {
                        let map_change = MapChange {
                            reference: state.reference().clone(),
                            previous_version: previous.clone(),
                            new_version: new_version.clone(),
                            modified_millis: modified,
                        };
                        let mut sink = changer.update(&map_change)?;
                        sink.write(&state.to_envelope(&new_version, modified))?;
                        sink.finish()?;
                    }
                    StagedChange::Remove(reference) => {
                        changer.remove(reference)?;
                    }
                }
            }
            Ok(())
        })?;

        Ok(Committer::new(
            inner,
            Arc::clone(&self.versions),
            remember,
            forget,
        ))
    }

    /// Drops every cached state. Idempotent; no durable effect.
    pub fn discard(&mut self) {
        if !self.states.is_empty() {
            debug!("discarding unit of work {}", self.identity);
        }
        self.states.clear();
    }
}

impl fmt::Debug for EntityStoreUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStoreUnitOfWork")
            .field("identity", &self.identity)
            .field("usecase", &self.usecase)
            .field("state_count", &self.state_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityStore;
    use optistore_storage::MemoryMapStore;
    use serde_json::json;

    fn entity_store() -> EntityStore {
        EntityStore::new(Arc::new(MemoryMapStore::new()))
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("Account")
    }

    #[test]
    fn create_caches_new_state() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        let reference = EntityReference::new("acct-1");

        let state = uow.create_state(&descriptor(), &reference).unwrap();
        assert_eq!(state.status(), EntityStatus::New);
        assert_eq!(uow.state_count(), 1);
    }

    #[test]
    fn duplicate_create_fails() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        let reference = EntityReference::new("acct-1");

        uow.create_state(&descriptor(), &reference).unwrap();
        let result = uow.create_state(&descriptor(), &reference);
        assert!(matches!(
            result,
            Err(CoreError::Storage(StorageError::AlreadyExists { .. }))
        ));
    }

    #[test]
    fn create_after_load_fails() {
        let store = entity_store();
        {
            let mut uow = store.new_unit_of_work(Usecase::default());
            uow.create_state(&descriptor(), &EntityReference::new("acct-1"))
                .unwrap();
            uow.complete().unwrap().commit().unwrap();
        }

        let mut uow = store.new_unit_of_work(Usecase::default());
        let reference = EntityReference::new("acct-1");
        uow.state_for(&reference).unwrap();
        let result = uow.create_state(&descriptor(), &reference);
        assert!(matches!(
            result,
            Err(CoreError::Storage(StorageError::AlreadyExists { .. }))
        ));
    }

    #[test]
    fn state_for_missing_fails() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        let result = uow.state_for(&EntityReference::new("missing"));
        assert!(result.is_err());
    }

    #[test]
    fn read_your_writes() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        let reference = EntityReference::new("acct-1");

        let state = uow.create_state(&descriptor(), &reference).unwrap();
        state.set_property("balance", json!(100));

        let seen = uow.state_for(&reference).unwrap();
        assert_eq!(seen.property("balance"), Some(&json!(100)));
    }

    #[test]
    fn version_of_probes_backend_without_caching() {
        let store = entity_store();
        {
            let mut uow = store.new_unit_of_work(Usecase::default());
            uow.create_state(&descriptor(), &EntityReference::new("acct-1"))
                .unwrap();
            uow.complete().unwrap().commit().unwrap();
        }

        let uow = store.new_unit_of_work(Usecase::default());
        let token = uow.version_of(&EntityReference::new("acct-1")).unwrap();
        assert!(!token.as_str().is_empty());
        assert_eq!(uow.state_count(), 0);
    }

    #[test]
    fn version_of_new_state_fails() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        let reference = EntityReference::new("acct-1");
        uow.create_state(&descriptor(), &reference).unwrap();

        let result = uow.version_of(&reference);
        assert!(matches!(
            result,
            Err(CoreError::Storage(StorageError::NotFound { .. }))
        ));
    }

    #[test]
    fn discard_is_idempotent() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        uow.create_state(&descriptor(), &EntityReference::new("acct-1"))
            .unwrap();

        uow.discard();
        assert_eq!(uow.state_count(), 0);
        uow.discard();
        assert_eq!(uow.state_count(), 0);
    }

    #[test]
    fn created_then_removed_state_is_dropped_from_batch() {
        let store = entity_store();
        let mut uow = store.new_unit_of_work(Usecase::default());
        let reference = EntityReference::new("acct-1");

        uow.create_state(&descriptor(), &reference).unwrap();
        uow.state_for(&reference).unwrap().mark_removed();

        uow.complete().unwrap().commit().unwrap();

        let mut fresh = store.new_unit_of_work(Usecase::default());
        assert!(fresh.state_for(&reference).is_err());
    }

    #[test]
    fn loaded_unmodified_states_are_not_written() {
        let store = entity_store();
        let first_version = {
            let mut uow = store.new_unit_of_work(Usecase::default());
            uow.create_state(&descriptor(), &EntityReference::new("acct-1"))
                .unwrap();
            uow.complete().unwrap().commit().unwrap();
            store.version_of(&EntityReference::new("acct-1")).unwrap()
        };

        let mut uow = store.new_unit_of_work(Usecase::default());
        uow.state_for(&EntityReference::new("acct-1")).unwrap();
        uow.complete().unwrap().commit().unwrap();

        let unchanged = store.version_of(&EntityReference::new("acct-1")).unwrap();
        assert_eq!(unchanged, first_version);
    }
}
