//! Contract conformance suite for `MapEntityStore` backends.
//!
//! Every backend runs the identical suite; each case uses its own
//! reference namespace so the whole suite can run against one store
//! instance.

use crate::account_envelope;
use optistore_storage::{
    EntityReference, MapChange, MapEntityStore, StorageError, VersionToken,
};

/// Stages and commits a single create.
///
/// # Panics
///
/// Panics if staging or commit fails.
pub fn commit_create(store: &dyn MapEntityStore, reference: &EntityReference, payload: &str) {
    let committer = store
        .apply_changes(&mut |changer| {
            let mut sink = changer.create(reference)?;
            sink.write(payload)?;
            sink.finish()
        })
        .expect("staging a create");
    committer.commit().expect("committing a create");
}

/// Stages and commits a single update.
///
/// # Panics
///
/// Panics if staging or commit fails.
pub fn commit_update(
    store: &dyn MapEntityStore,
    reference: &EntityReference,
    previous_version: &str,
    new_version: &str,
    payload: &str,
) {
    let change = MapChange {
        reference: reference.clone(),
        previous_version: VersionToken::new(previous_version),
        new_version: VersionToken::new(new_version),
        modified_millis: 0,
    };
    let committer = store
        .apply_changes(&mut |changer| {
            let mut sink = changer.update(&change)?;
            sink.write(payload)?;
            sink.finish()
        })
        .expect("staging an update");
    committer.commit().expect("committing an update");
}

/// Runs the whole conformance suite against one backend.
///
/// # Panics
///
/// Panics on the first contract violation.
pub fn run_all(store: &dyn MapEntityStore) {
    fetch_missing_fails(store);
    create_visible_only_after_commit(store);
    create_existing_rejected(store);
    update_missing_rejected(store);
    update_replaces_payload_byte_identical(store);
    remove_missing_rejected(store);
    remove_deletes_durably(store);
    cancel_leaves_no_trace(store);
    all_states_covers_committed_entities(store);
}

/// Fetching a reference with no durable state fails with `NotFound`.
pub fn fetch_missing_fails(store: &dyn MapEntityStore) {
    let result = store.fetch(&EntityReference::new("conf-missing"));
    assert!(
        matches!(result, Err(StorageError::NotFound { .. })),
        "fetch of a missing reference must fail with NotFound"
    );
}

/// A staged create is invisible until its committer commits.
pub fn create_visible_only_after_commit(store: &dyn MapEntityStore) {
    let reference = EntityReference::new("conf-create");
    let payload = account_envelope("conf-create", "v1", 100);

    let committer = store
        .apply_changes(&mut |changer| {
            let mut sink = changer.create(&reference)?;
            sink.write(&payload)?;
            sink.finish()
        })
        .expect("staging");
    assert!(
        store.fetch(&reference).is_err(),
        "staged create must not be visible before commit"
    );

    committer.commit().expect("commit");
    assert_eq!(store.fetch(&reference).expect("fetch after commit"), payload);
}

/// Creating over durable state fails with `AlreadyExists`.
pub fn create_existing_rejected(store: &dyn MapEntityStore) {
    let reference = EntityReference::new("conf-create-dup");
    commit_create(store, &reference, &account_envelope("conf-create-dup", "v1", 1));

    let result = store.apply_changes(&mut |changer| {
        let mut sink = changer.create(&reference)?;
        sink.write(&account_envelope("conf-create-dup", "v2", 2))?;
        sink.finish()
    });
    assert!(
        matches!(result, Err(StorageError::AlreadyExists { .. })),
        "second create at an occupied reference must fail"
    );
}

/// Updating a reference with no durable state fails with `NotFound`.
pub fn update_missing_rejected(store: &dyn MapEntityStore) {
    let reference = EntityReference::new("conf-update-missing");
    let change = MapChange {
        reference: reference.clone(),
        previous_version: VersionToken::new("v1"),
        new_version: VersionToken::new("v2"),
        modified_millis: 0,
    };
    let result = store.apply_changes(&mut |changer| {
        let mut sink = changer.update(&change)?;
        sink.write(&account_envelope("conf-update-missing", "v2", 1))?;
        sink.finish()
    });
    assert!(
        matches!(result, Err(StorageError::NotFound { .. })),
        "update of a missing reference must fail"
    );
}

/// A committed update's payload round-trips byte-identically.
pub fn update_replaces_payload_byte_identical(store: &dyn MapEntityStore) {
    let reference = EntityReference::new("conf-update");
    commit_create(store, &reference, &account_envelope("conf-update", "v1", 100));

    let replacement = account_envelope("conf-update", "v2", 150);
    commit_update(store, &reference, "v1", "v2", &replacement);

    assert_eq!(
        store.fetch(&reference).expect("fetch after update"),
        replacement,
        "fetched payload must be byte-identical to what was written"
    );
}

/// Removing a reference with no durable state fails with `NotFound`.
pub fn remove_missing_rejected(store: &dyn MapEntityStore) {
    let reference = EntityReference::new("conf-remove-missing");
    let result = store.apply_changes(&mut |changer| changer.remove(&reference));
    assert!(
        matches!(result, Err(StorageError::NotFound { .. })),
        "removal of a missing reference must fail"
    );
}

/// A committed removal deletes the durable state.
pub fn remove_deletes_durably(store: &dyn MapEntityStore) {
    let reference = EntityReference::new("conf-remove");
    commit_create(store, &reference, &account_envelope("conf-remove", "v1", 1));

    let committer = store
        .apply_changes(&mut |changer| changer.remove(&reference))
        .expect("staging removal");
    committer.commit().expect("committing removal");

    assert!(
        matches!(store.fetch(&reference), Err(StorageError::NotFound { .. })),
        "removed entity must not be fetchable"
    );
}

/// A cancelled batch leaves every entity at its pre-batch state.
pub fn cancel_leaves_no_trace(store: &dyn MapEntityStore) {
    let updated = EntityReference::new("conf-cancel-upd");
    let removed = EntityReference::new("conf-cancel-rm");
    let fresh = EntityReference::new("conf-cancel-new");
    let before_update = account_envelope("conf-cancel-upd", "v1", 1);
    let before_remove = account_envelope("conf-cancel-rm", "v1", 2);
    commit_create(store, &updated, &before_update);
    commit_create(store, &removed, &before_remove);

    let committer = store
        .apply_changes(&mut |changer| {
            let change = MapChange {
                reference: updated.clone(),
                previous_version: VersionToken::new("v1"),
                new_version: VersionToken::new("v2"),
                modified_millis: 0,
            };
            let mut sink = changer.update(&change)?;
            sink.write(&account_envelope("conf-cancel-upd", "v2", 9))?;
            sink.finish()?;

            let mut sink = changer.create(&fresh)?;
            sink.write(&account_envelope("conf-cancel-new", "v2", 0))?;
            sink.finish()?;

            changer.remove(&removed)
        })
        .expect("staging");

    committer.cancel();

    assert_eq!(store.fetch(&updated).expect("fetch"), before_update);
    assert_eq!(store.fetch(&removed).expect("fetch"), before_remove);
    assert!(
        matches!(store.fetch(&fresh), Err(StorageError::NotFound { .. })),
        "cancelled create must leave nothing behind"
    );
}

/// `all_states` yields every committed entity's payload.
pub fn all_states_covers_committed_entities(store: &dyn MapEntityStore) {
    let payloads: Vec<String> = (0..5)
        .map(|i| account_envelope(&format!("conf-scan-{i}"), "v1", i))
        .collect();
    for (i, payload) in payloads.iter().enumerate() {
        commit_create(store, &EntityReference::new(format!("conf-scan-{i}")), payload);
    }

    let seen: Vec<String> = store
        .all_states()
        .expect("all_states")
        .collect::<Result<_, _>>()
        .expect("scanning states");
    for payload in &payloads {
        assert!(
            seen.contains(payload),
            "all_states must include every committed payload"
        );
    }
}
