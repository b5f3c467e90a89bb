//! Reserved keys of the stored payload envelope.
//!
//! Every payload is a JSON object whose top-level keys are reserved by
//! this layer; the caller's state lives under [`KEY_VALUE`]. Backends
//! treat payloads as opaque text with two exceptions that are part of
//! the persisted contract: backup restore routes each payload by its
//! own reference, and version probes read the version key without
//! deserializing the rest.

use crate::error::{StorageError, StorageResult};
use crate::reference::{EntityReference, VersionToken};
use serde_json::Value;

/// Identity of the entity the payload belongs to.
pub const KEY_REFERENCE: &str = "reference";
/// Entity type name.
pub const KEY_TYPE: &str = "type";
/// Version token of this durable revision.
pub const KEY_VERSION: &str = "version";
/// Last-modified time in epoch milliseconds.
pub const KEY_MODIFIED: &str = "modified";
/// The caller's state object.
pub const KEY_VALUE: &str = "value";

fn string_key(payload: &str, key: &'static str) -> StorageResult<String> {
    let document: Value = serde_json::from_str(payload)
        .map_err(|e| StorageError::corrupted(format!("malformed payload envelope: {e}")))?;
    document
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| StorageError::corrupted(format!("payload envelope lacks \"{key}\"")))
}

/// Reads the self-describing reference out of a payload envelope.
pub fn envelope_reference(payload: &str) -> StorageResult<EntityReference> {
    string_key(payload, KEY_REFERENCE).map(EntityReference::from)
}

/// Reads the version token out of a payload envelope.
pub fn envelope_version(payload: &str) -> StorageResult<VersionToken> {
    string_key(payload, KEY_VERSION).map(VersionToken::from)
}
