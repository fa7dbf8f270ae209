//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                        ┌── room actor "post-1" ── Document
//!             ├── Gateway ── Registry ─┤        │ Relay / Presence
//! Client B ──┘      │                 └── room actor "post-2"  │
//!                   │                                          ▼
//!               ClaimBook ── Orchestrator             Reconciler ── DocumentStore
//! ```
//!
//! One task per connection, one task per live room, one reconciler task per
//! live room. Rooms never share locks with each other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::auth::Authenticator;
use crate::claims::{ClaimBook, Orchestrator};
use crate::gateway::{Gateway, GatewayConfig};
use crate::registry::RoomRegistry;
use crate::room::RoomConfig;
use crate::storage::{DocumentStore, MemoryStore, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Trusted `Origin` values; empty admits all
    pub allowed_origins: Vec<String>,
    /// Per-connection outbound buffer, in events
    pub outbox_capacity: usize,
    /// Disconnect connections silent for this long
    pub idle_timeout: Duration,
    pub room: RoomConfig,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            allowed_origins: gateway.allowed_origins,
            outbox_capacity: gateway.outbox_capacity,
            idle_timeout: gateway.idle_timeout,
            room: RoomConfig::default(),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            allowed_origins: self.allowed_origins.clone(),
            outbox_capacity: self.outbox_capacity,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_sessions: usize,
    pub active_rooms: usize,
    pub rejected_origins: u64,
    pub auth_failures: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub claims: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
}

impl SyncServer {
    /// Build a server, opening the configured store.
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Self, StoreError> {
        let store = open_store(config.storage_path.as_ref())?;
        Ok(Self::with_store(config, store, auth, orchestrator))
    }

    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        auth: Arc<dyn Authenticator>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(store, config.room.clone()));
        let claims = Arc::new(ClaimBook::new(orchestrator));
        let gateway = Arc::new(Gateway::new(config.gateway(), registry, auth, claims));
        Self { config, gateway }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.serve_connection(stream, addr).await {
                    log::info!("connection from {addr} ended: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let gateway = self.gateway.stats().await;
        ServerStats {
            total_connections: gateway.total_connections,
            active_sessions: gateway.active_sessions,
            active_rooms: self.gateway.registry().room_count().await,
            rejected_origins: gateway.rejected_origins,
            auth_failures: gateway.auth_failures,
            total_messages: gateway.messages,
            malformed_messages: gateway.malformed,
            claims: self.gateway.claims().len(),
        }
    }

    /// Flush and retire every live room.
    pub async fn shutdown(&self) {
        self.gateway.registry().shutdown().await;
    }
}

#[cfg(feature = "rocksdb")]
fn open_store(path: Option<&PathBuf>) -> Result<Arc<dyn DocumentStore>, StoreError> {
    use crate::storage::{RocksStore, StoreConfig};
    match path {
        Some(path) => {
            let config = StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            };
            Ok(Arc::new(RocksStore::open(config)?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(path: Option<&PathBuf>) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match path {
        Some(path) => Err(StoreError::Unavailable(format!(
            "cannot open {}: built without the `rocksdb` feature",
            path.display()
        ))),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use crate::claims::LogOrchestrator;

    fn server(config: ServerConfig) -> Result<SyncServer, StoreError> {
        SyncServer::new(config, Arc::new(StaticTokens::new()), Arc::new(LogOrchestrator))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.allowed_origins, vec!["http://localhost:5173"]);
        assert_eq!(config.outbox_capacity, 256);
        assert_eq!(config.room.grace_period, Duration::from_secs(5));
        assert_eq!(config.room.save_interval, Duration::from_millis(500));
        assert!(config.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = server(ServerConfig::default()).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[cfg(not(feature = "rocksdb"))]
    #[test]
    fn test_storage_path_needs_rocksdb() {
        let config = ServerConfig {
            storage_path: Some(PathBuf::from("/tmp/pairwise")),
            ..ServerConfig::default()
        };
        assert!(matches!(server(config), Err(StoreError::Unavailable(_))));
    }

    #[cfg(feature = "rocksdb")]
    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        assert!(server(config).is_ok());
    }
}
