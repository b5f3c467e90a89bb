//! Error types for storage operations.

use crate::reference::EntityReference;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested reference has no durable state.
    #[error("entity not found: {reference}")]
    NotFound {
        /// The reference that was looked up.
        reference: EntityReference,
    },

    /// A create was attempted at an occupied reference.
    #[error("entity already exists: {reference}")]
    AlreadyExists {
        /// The occupied reference.
        reference: EntityReference,
    },

    /// The backend's own optimistic locking rejected a write.
    #[error("backend detected concurrent modification of {reference}")]
    Conflict {
        /// The reference whose write was rejected.
        reference: EntityReference,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A remote store call failed.
    #[error("remote store error: {message}")]
    Remote {
        /// Description of the failure.
        message: String,
    },

    /// Stored data is malformed.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// The storage directory is held by another process.
    #[error("storage directory is locked by another process")]
    Locked,

    /// The store configuration is unusable.
    #[error("invalid store configuration: {0}")]
    InvalidConfiguration(String),

    /// The backend cannot perform the requested operation.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found(reference: &EntityReference) -> Self {
        Self::NotFound {
            reference: reference.clone(),
        }
    }

    /// Creates an already-exists error.
    pub fn already_exists(reference: &EntityReference) -> Self {
        Self::AlreadyExists {
            reference: reference.clone(),
        }
    }

    /// Creates a backend conflict error.
    pub fn conflict(reference: &EntityReference) -> Self {
        Self::Conflict {
            reference: reference.clone(),
        }
    }

    /// Creates a remote store error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Creates a corrupted-store error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}
