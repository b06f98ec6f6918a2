//! WebSocket accept loop and process-level wiring.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Room "jam1" ── members / awaiting_state
//!             ├── connection ── Hub ┤
//! Client B ──┘   (actor)            └── OperationLog ── RoomStore
//!                                          │               ├── MemoryRoomStore
//!                                          │               └── RocksRoomStore (LZ4)
//!                                          └── RoomDirectory
//!                                                  ├── OpenDirectory
//!                                                  └── StaticDirectory
//! ```
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::connection::run_connection;
use crate::directory::{OpenDirectory, RoomDirectory, StaticDirectory};
use crate::hub::{Hub, HubConfig};
use crate::oplog::{LogConfig, LogError, OperationLog};
use crate::storage::{MemoryRoomStore, RocksRoomStore, RoomStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Known room names (None = every name is a room)
    pub rooms: Option<Vec<String>>,
    pub hub: HubConfig,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            rooms: None,
            hub: HubConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: \"{value}\"")]
    InvalidValue { key: &'static str, value: String },
}

fn parse_u64(key: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

impl ServerConfig {
    /// Build a config from `JAM_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("JAM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("JAM_STORAGE_PATH").filter(|p| !p.is_empty()) {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("JAM_MAX_OPS_PER_BUCKET") {
            config.log.max_ops_per_bucket = parse_u64("JAM_MAX_OPS_PER_BUCKET", value)?;
        }
        if let Some(value) = lookup("JAM_SEND_TIMEOUT_MS") {
            config.hub.send_timeout =
                Duration::from_millis(parse_u64("JAM_SEND_TIMEOUT_MS", value)?);
        }
        if let Some(value) = lookup("JAM_STATE_TIMEOUT_MS") {
            config.hub.state_timeout =
                Duration::from_millis(parse_u64("JAM_STATE_TIMEOUT_MS", value)?);
        }
        if let Some(list) = lookup("JAM_ROOMS") {
            let rooms: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
            config.rooms = Some(rooms);
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn RoomStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksRoomStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryRoomStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an already opened store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn RoomStore>) -> Self {
        let directory: Arc<dyn RoomDirectory> = match &config.rooms {
            Some(names) => Arc::new(StaticDirectory::with_rooms(names.iter().cloned())),
            None => Arc::new(OpenDirectory),
        };
        let oplog = OperationLog::new(store, directory, config.log.clone());
        let hub = Arc::new(Hub::new(config.hub.clone(), Arc::new(oplog)));
        Self { config, hub }
    }

    /// In-memory server on the default address.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryRoomStore::new()))
    }

    /// Create a server with RocksDB persistence.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, ServerError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// Member counts left over from a previous process are zeroed first.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.hub.oplog().reset_member_counts().await?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => run_connection(ws, hub, addr).await,
                    Err(e) => log::error!("WebSocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
