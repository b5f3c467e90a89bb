//! Store configuration and backend selection.

use crate::error::{StorageError, StorageResult};
use crate::file::FileMapStore;
use crate::memory::MemoryMapStore;
use crate::remote::{KvTransport, RemoteMapStore};
use crate::store::MapEntityStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the sharded local-file backend.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Storage directory holding slices, shards, and scratch space.
    pub directory: PathBuf,
    /// Shard fan-out, `[1, 10000]`. Fixed at first initialization;
    /// reopening an existing store ignores this value.
    pub slices: u32,
}

impl FileStoreConfig {
    /// Creates a configuration with the default fan-out of 10 slices.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            slices: 10,
        }
    }

    /// Sets the shard fan-out.
    #[must_use]
    pub fn with_slices(mut self, slices: u32) -> Self {
        self.slices = slices;
        self
    }

    /// Returns a fan-out suited to the expected entity count.
    ///
    /// Approximately the square root of the count, clamped to
    /// `[1, 10000]`, which bounds per-directory file counts to about
    /// the same order as the directory count.
    #[must_use]
    pub fn recommended_slices(expected_entities: u64) -> u32 {
        let root = (expected_entities as f64).sqrt().round() as u64;
        root.clamp(1, u64::from(crate::file::MAX_SLICES)) as u32
    }
}

/// Authentication material for a remote backend.
#[derive(Debug, Clone)]
pub struct RemoteCredentials {
    /// Account or principal name.
    pub username: String,
    /// Password, token, or other shared secret.
    pub secret: String,
}

/// Configuration for a remote key-value backend.
///
/// Consumed by [`KvTransport`] implementations when they establish
/// their connections; [`crate::RemoteMapStore`] itself only reads the
/// endpoint list for diagnostics.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Host/port list of the remote service.
    pub endpoints: Vec<String>,
    /// Optional authentication material.
    pub credentials: Option<RemoteCredentials>,
    /// Timeout for establishing a connection.
    pub connection_timeout: Duration,
    /// Idle time after which pooled connections are dropped.
    pub idle_timeout: Duration,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// Name of the keyspace or store holding the entities.
    pub store_name: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            credentials: None,
            connection_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_connections: 8,
            store_name: "optistore-entities".to_owned(),
        }
    }
}

impl RemoteConfig {
    /// Creates a configuration for the given endpoints.
    pub fn new(endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the authentication material.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some(RemoteCredentials {
            username: username.into(),
            secret: secret.into(),
        });
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the connection pool bound.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets the remote store or keyspace name.
    #[must_use]
    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }
}

/// Backend selection, decided at process configuration time.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// In-memory backend (testing, ephemeral data).
    Memory,
    /// Sharded local-file backend.
    File(FileStoreConfig),
    /// Remote key-value backend.
    Remote(RemoteConfig),
}

impl StoreConfig {
    /// Returns the backend kind as a string, for logs and diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File(_) => "file",
            Self::Remote(_) => "remote",
        }
    }

    /// Creates a file-backend configuration.
    pub fn file(directory: impl AsRef<Path>) -> Self {
        Self::File(FileStoreConfig::new(directory.as_ref()))
    }
}

/// Opens the store selected by `config`.
///
/// The remote backend needs an established [`KvTransport`]; passing
/// `None` for it with a remote configuration is an error. Local
/// backends ignore the transport argument.
///
/// # Errors
///
/// Propagates backend initialization failures, and fails with
/// [`StorageError::InvalidConfiguration`] when a remote configuration
/// arrives without a transport.
pub fn open_store(
    config: &StoreConfig,
    transport: Option<Arc<dyn KvTransport>>,
) -> StorageResult<Arc<dyn MapEntityStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryMapStore::new())),
        StoreConfig::File(file) => Ok(Arc::new(FileMapStore::open(&file.directory, file.slices)?)),
        StoreConfig::Remote(remote) => {
            let transport = transport.ok_or_else(|| {
                StorageError::invalid_configuration("remote backend requires a transport")
            })?;
            Ok(Arc::new(RemoteMapStore::new(transport, remote.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryKvTransport;
    use tempfile::tempdir;

    #[test]
    fn recommended_slices_tracks_square_root() {
        assert_eq!(FileStoreConfig::recommended_slices(0), 1);
        assert_eq!(FileStoreConfig::recommended_slices(100), 10);
        assert_eq!(FileStoreConfig::recommended_slices(1_000_000), 1000);
        assert_eq!(
            FileStoreConfig::recommended_slices(u64::MAX),
            crate::file::MAX_SLICES
        );
    }

    #[test]
    fn builder_pattern() {
        let config = RemoteConfig::new(["kv-1:6500", "kv-2:6500"])
            .with_credentials("svc", "hunter2")
            .with_connection_timeout(Duration::from_secs(3))
            .with_max_connections(32)
            .with_store_name("entities");

        assert_eq!(config.endpoints.len(), 2);
        assert!(config.credentials.is_some());
        assert_eq!(config.connection_timeout, Duration::from_secs(3));
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.store_name, "entities");
    }

    #[test]
    fn open_store_selects_backend_kind() {
        let dir = tempdir().unwrap();
        let memory = open_store(&StoreConfig::Memory, None).unwrap();
        assert!(memory.all_states().unwrap().next().is_none());

        let file = open_store(&StoreConfig::file(dir.path()), None).unwrap();
        assert!(file.all_states().unwrap().next().is_none());

        let remote = open_store(
            &StoreConfig::Remote(RemoteConfig::default()),
            Some(Arc::new(InMemoryKvTransport::new())),
        )
        .unwrap();
        assert!(remote.all_states().unwrap().next().is_none());
    }

    #[test]
    fn remote_without_transport_is_rejected() {
        let result = open_store(&StoreConfig::Remote(RemoteConfig::default()), None);
        assert!(matches!(
            result,
            Err(StorageError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn kind_names() {
        assert_eq!(StoreConfig::Memory.kind(), "memory");
        assert_eq!(StoreConfig::file("/tmp/x").kind(), "file");
        assert_eq!(StoreConfig::Remote(RemoteConfig::default()).kind(), "remote");
    }
}
