//! Runs the conformance suite against every shipped backend.

use optistore_storage::{InMemoryKvTransport, MemoryMapStore, RemoteConfig, RemoteMapStore};
use optistore_testkit::{conformance, temp_file_store};
use std::sync::Arc;

#[test]
fn memory_backend_conformance() {
    let store = MemoryMapStore::new();
    conformance::run_all(&store);
}

#[test]
fn file_backend_conformance() {
    let (_dir, store) = temp_file_store(5);
    conformance::run_all(&store);
}

#[test]
fn file_backend_conformance_single_slice() {
    let (_dir, store) = temp_file_store(1);
    conformance::run_all(&store);
}

#[test]
fn remote_backend_conformance() {
    let transport = Arc::new(InMemoryKvTransport::new());
    let store = RemoteMapStore::new(transport, RemoteConfig::new(["kv-1:6500"]));
    conformance::run_all(&store);
}
