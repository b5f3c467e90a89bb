//! # OptiStore Testkit
//!
//! Test utilities for OptiStore.
//!
//! Provides payload builders and the [`conformance`] suite that every
//! `MapEntityStore` backend must pass. Backend crates and integration
//! tests drive the same suite so the contract stays identical across
//! heterogeneous storage engines.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod conformance;

use optistore_storage::FileMapStore;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Opens a file store in a fresh temporary directory.
///
/// The returned guard keeps the directory alive; the store is gone
/// when both are dropped.
///
/// # Panics
///
/// Panics if the temporary directory or the store cannot be created.
pub fn temp_file_store(slices: u32) -> (TempDir, FileMapStore) {
    let dir = TempDir::new().expect("creating a temporary directory");
    let store = FileMapStore::open(dir.path(), slices).expect("opening a file store");
    (dir, store)
}

/// Builds a payload envelope with the reserved keys this layer
/// persists.
pub fn envelope(
    reference: &str,
    entity_type: &str,
    version: &str,
    modified_millis: u64,
    value: Value,
) -> String {
    json!({
        "reference": reference,
        "type": entity_type,
        "version": version,
        "modified": modified_millis,
        "value": value,
    })
    .to_string()
}

/// Builds an account entity payload, the working example used
/// throughout the tests.
pub fn account_envelope(reference: &str, version: &str, balance: i64) -> String {
    envelope(
        reference,
        "Account",
        version,
        0,
        json!({ "balance": balance }),
    )
}
