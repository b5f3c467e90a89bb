//! Error types for the transactional core.

use optistore_storage::{EntityReference, StorageError};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the transactional core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON codec error.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A payload envelope is structurally wrong.
    #[error("malformed entity envelope: {message}")]
    Envelope {
        /// Description of the defect.
        message: String,
    },

    /// Commit-time conflict with one or more concurrent transactions.
    ///
    /// Carries every conflicting reference found in the batch, so the
    /// caller can retry or merge in one round trip instead of
    /// discovering conflicts one at a time.
    #[error("concurrent modification of {references:?}")]
    ConcurrentModification {
        /// All references whose durable version no longer matches.
        references: Vec<EntityReference>,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a malformed-envelope error.
    pub fn envelope(message: impl Into<String>) -> Self {
        Self::Envelope {
            message: message.into(),
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a commit-time version conflict.
    #[must_use]
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// Returns `true` if this wraps a missing-entity failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound { .. }))
    }
}
