//! Entity identity and version token types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, globally unique identity of a stored entity.
///
/// References are plain strings scoped to an entity type. They are:
/// - Immutable once assigned
/// - The sole key into every cache and store in this workspace
/// - Portable across backends (the file backend escapes them for the
///   filesystem, see [`crate::FileMapStore`])
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityReference(String);

impl EntityReference {
    /// Creates a reference from an identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Returns the identity string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityReference({})", self.0)
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityReference {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}

impl From<String> for EntityReference {
    fn from(identity: String) -> Self {
        Self(identity)
    }
}

/// Opaque marker of a specific durable revision of an entity.
///
/// Tokens are comparable only for equality, never for ordering. A token
/// is immutable once assigned; every successful durable write produces
/// a new token for that entity.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    /// Creates a token from its string form.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionToken({})", self.0)
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for VersionToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn reference_round_trip() {
        let reference = EntityReference::new("acct-1");
        assert_eq!(reference.as_str(), "acct-1");
        assert_eq!(format!("{reference}"), "acct-1");
    }

    #[test]
    fn reference_equality_and_hashing() {
        let a = EntityReference::new("acct-1");
        let b = EntityReference::from("acct-1");
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn token_equality_only() {
        let a = VersionToken::new("v1");
        let b = VersionToken::new("v1");
        let c = VersionToken::new("v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serde_transparent() {
        let reference = EntityReference::new("acct-1");
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"acct-1\"");
        let back: EntityReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
