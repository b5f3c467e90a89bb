//! Entity state and its payload envelope.

use crate::error::{CoreError, CoreResult};
use optistore_storage::{
    EntityReference, VersionToken, KEY_MODIFIED, KEY_REFERENCE, KEY_TYPE, KEY_VALUE, KEY_VERSION,
};
use serde_json::{Map, Value};

/// Lifecycle status of an entity state within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Created in this transaction; no durable counterpart yet.
    New,
    /// Loaded from the backend and not modified.
    Loaded,
    /// Loaded from the backend and modified in this transaction.
    Updated,
    /// Scheduled for removal at commit.
    Removed,
}

/// Type descriptor handed to `create_state`.
///
/// The domain-object layer supplies it; this core only records the
/// type name in the payload envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    entity_type: String,
}

impl EntityDescriptor {
    /// Creates a descriptor for the given entity type name.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
        }
    }

    /// Returns the entity type name.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }
}

/// One entity's attributes and associations at a point in time.
///
/// Owned exclusively by a transaction's state cache for the
/// transaction's duration and handed to a backend only at commit.
/// The caller's generic state representation lives in the `value`
/// object; this core never interprets it beyond JSON structure.
#[derive(Debug, Clone)]
pub struct EntityState {
    reference: EntityReference,
    entity_type: String,
    version: Option<VersionToken>,
    modified_millis: u64,
    status: EntityStatus,
    value: Value,
}

impl EntityState {
    /// Creates a fresh state with status [`EntityStatus::New`].
    ///
    /// A new state never carries a version token; its first token is
    /// assigned by the commit that makes it durable.
    pub(crate) fn new_state(
        reference: EntityReference,
        descriptor: &EntityDescriptor,
        modified_millis: u64,
    ) -> Self {
        Self {
            reference,
            entity_type: descriptor.entity_type().to_owned(),
            version: None,
            modified_millis,
            status: EntityStatus::New,
            value: Value::Object(Map::new()),
        }
    }

    /// Returns the entity reference.
    #[must_use]
    pub fn reference(&self) -> &EntityReference {
        &self.reference
    }

    /// Returns the entity type name.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the version token captured when this state was loaded,
    /// or `None` for a state created in this transaction.
    #[must_use]
    pub fn version(&self) -> Option<&VersionToken> {
        self.version.as_ref()
    }

    /// Returns the last-modified time in epoch milliseconds.
    #[must_use]
    pub fn modified_millis(&self) -> u64 {
        self.modified_millis
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// Returns the caller's state object.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Replaces the caller's state object.
    ///
    /// Marks a loaded state as updated; a new state stays new.
    pub fn set_value(&mut self, value: Value) {
        self.value = value;
        self.touch();
    }

    /// Reads one property out of the state object.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.value.as_object().and_then(|object| object.get(key))
    }

    /// Writes one property into the state object.
    ///
    /// Marks a loaded state as updated; a new state stays new.
    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        if let Value::Object(object) = &mut self.value {
            object.insert(key.into(), value);
        } else {
            let mut object = Map::new();
            object.insert(key.into(), value);
            self.value = Value::Object(object);
        }
        self.touch();
    }

    /// Schedules the entity for removal at commit.
    pub fn mark_removed(&mut self) {
        self.status = EntityStatus::Removed;
    }

    fn touch(&mut self) {
        if self.status == EntityStatus::Loaded {
            self.status = EntityStatus::Updated;
        }
    }

    /// Serializes the state into its payload envelope, stamping the
    /// version and modification time the committing transaction
    /// assigns.
    pub(crate) fn to_envelope(&self, version: &VersionToken, modified_millis: u64) -> String {
        let mut envelope = Map::new();
        envelope.insert(
            KEY_REFERENCE.to_owned(),
            Value::String(self.reference.as_str().to_owned()),
        );
        envelope.insert(KEY_TYPE.to_owned(), Value::String(self.entity_type.clone()));
        envelope.insert(
            KEY_VERSION.to_owned(),
            Value::String(version.as_str().to_owned()),
        );
        envelope.insert(KEY_MODIFIED.to_owned(), Value::from(modified_millis));
        envelope.insert(KEY_VALUE.to_owned(), self.value.clone());
        Value::Object(envelope).to_string()
    }

    /// Deserializes a payload envelope into a state with status
    /// [`EntityStatus::Loaded`].
    pub fn from_envelope(payload: &str) -> CoreResult<Self> {
        let document: Value = serde_json::from_str(payload)?;
        let envelope = document
            .as_object()
            .ok_or_else(|| CoreError::envelope("payload is not a JSON object"))?;

        let string_key = |key: &str| -> CoreResult<String> {
            envelope
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| CoreError::envelope(format!("missing string key \"{key}\"")))
        };

        let modified_millis = envelope
            .get(KEY_MODIFIED)
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::envelope(format!("missing numeric key \"{KEY_MODIFIED}\"")))?;
        let value = envelope
            .get(KEY_VALUE)
            .cloned()
            .ok_or_else(|| CoreError::envelope(format!("missing key \"{KEY_VALUE}\"")))?;

        Ok(Self {
            reference: EntityReference::new(string_key(KEY_REFERENCE)?),
            entity_type: string_key(KEY_TYPE)?,
            version: Some(VersionToken::new(string_key(KEY_VERSION)?)),
            modified_millis,
            status: EntityStatus::Loaded,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new("Account")
    }

    #[test]
    fn new_state_has_no_version() {
        let state = EntityState::new_state(EntityReference::new("acct-1"), &descriptor(), 42);
        assert_eq!(state.status(), EntityStatus::New);
        assert!(state.version().is_none());
        assert_eq!(state.value(), &json!({}));
    }

    #[test]
    fn new_state_stays_new_when_mutated() {
        let mut state = EntityState::new_state(EntityReference::new("acct-1"), &descriptor(), 0);
        state.set_property("balance", json!(100));
        assert_eq!(state.status(), EntityStatus::New);
    }

    #[test]
    fn loaded_state_becomes_updated_when_mutated() {
        let state = EntityState::new_state(EntityReference::new("acct-1"), &descriptor(), 7);
        let payload = state.to_envelope(&VersionToken::new("v1"), 7);

        let mut loaded = EntityState::from_envelope(&payload).unwrap();
        assert_eq!(loaded.status(), EntityStatus::Loaded);
        loaded.set_property("balance", json!(150));
        assert_eq!(loaded.status(), EntityStatus::Updated);
        assert_eq!(loaded.property("balance"), Some(&json!(150)));
    }

    #[test]
    fn envelope_round_trip() {
        let mut state = EntityState::new_state(EntityReference::new("acct-1"), &descriptor(), 0);
        state.set_value(json!({"balance": 100, "owner": "alice"}));

        let payload = state.to_envelope(&VersionToken::new("v1"), 99);
        let loaded = EntityState::from_envelope(&payload).unwrap();

        assert_eq!(loaded.reference(), &EntityReference::new("acct-1"));
        assert_eq!(loaded.entity_type(), "Account");
        assert_eq!(loaded.version(), Some(&VersionToken::new("v1")));
        assert_eq!(loaded.modified_millis(), 99);
        assert_eq!(loaded.value(), &json!({"balance": 100, "owner": "alice"}));
    }

    #[test]
    fn from_envelope_rejects_missing_keys() {
        let result = EntityState::from_envelope(r#"{"reference":"acct-1"}"#);
        assert!(matches!(result, Err(CoreError::Envelope { .. })));
    }

    #[test]
    fn from_envelope_rejects_non_object() {
        let result = EntityState::from_envelope("[1, 2, 3]");
        assert!(matches!(result, Err(CoreError::Envelope { .. })));
    }

    #[test]
    fn mark_removed() {
        let mut state = EntityState::new_state(EntityReference::new("acct-1"), &descriptor(), 0);
        state.mark_removed();
        assert_eq!(state.status(), EntityStatus::Removed);
    }
}
