//! Shared server state handed to every connection and handler.
//!
//! ```text
//!                    ┌──────────────── Hub ────────────────┐
//!   connection ────► │ ClientRegistry   conn_id → Client   │
//!   dispatch   ────► │ RoomRegistry     name    → Room     │
//!                    │ OperationLog     ──► RoomStore      │
//!                    └─────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::client::{Client, ClientRegistry};
use crate::directory::OpenDirectory;
use crate::oplog::{LogConfig, LogError, OperationLog};
use crate::protocol::{Push, ServerMessage};
use crate::room::{Room, RoomRegistry};
use crate::storage::{MemoryRoomStore, RoomMetadata};

/// Connection and handshake tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound messages buffered per client (default: 64)
    pub mailbox_capacity: usize,
    /// Max wait for mailbox space before a send fails (default: 500ms)
    pub send_timeout: Duration,
    /// Max wait for a peer's full state during a join (default: 500ms)
    pub state_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            send_timeout: Duration::from_millis(500),
            state_timeout: Duration::from_millis(500),
        }
    }
}

impl HubConfig {
    /// Short timeouts so silent-peer paths finish fast in tests.
    pub fn for_testing() -> Self {
        Self {
            mailbox_capacity: 16,
            send_timeout: Duration::from_millis(100),
            state_timeout: Duration::from_millis(100),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

pub struct Hub {
    config: HubConfig,
    clients: ClientRegistry,
    rooms: RoomRegistry,
    oplog: Arc<OperationLog>,
    stats: RwLock<HubStats>,
}

impl Hub {
    pub fn new(config: HubConfig, oplog: Arc<OperationLog>) -> Self {
        Self {
            config,
            clients: ClientRegistry::new(),
            rooms: RoomRegistry::new(),
            oplog,
            stats: RwLock::new(HubStats::default()),
        }
    }

    /// Hub over an in-memory store that accepts every room name.
    pub fn with_memory_store(config: HubConfig, log_config: LogConfig) -> Self {
        let oplog = OperationLog::new(
            Arc::new(MemoryRoomStore::new()),
            Arc::new(OpenDirectory),
            log_config,
        );
        Self::new(config, Arc::new(oplog))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn oplog(&self) -> &Arc<OperationLog> {
        &self.oplog
    }

    /// Register a new connection.
    pub async fn connect(&self) -> (Arc<Client>, mpsc::Receiver<ServerMessage>) {
        let (client, rx) = Client::new(&self.config);
        self.clients.insert(client.clone()).await;
        self.stats.write().await.total_connections += 1;
        (client, rx)
    }

    /// Count an inbound frame.
    pub async fn record_message(&self, bytes: usize) {
        let mut stats = self.stats.write().await;
        stats.total_messages += 1;
        stats.total_bytes += bytes as u64;
    }

    pub async fn stats(&self) -> HubStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_connections = self.clients.len().await;
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Take `client` out of its room.
    ///
    /// If the client was a full member, the persisted member count is
    /// decremented and the new count broadcast to the remaining members. A
    /// client still in its join handshake only drops the room reference.
    pub async fn leave_room(&self, client: &Arc<Client>) -> Option<Arc<Room>> {
        let room = client.take_room().await?;
        let conn_id = client.conn_id();

        room.stop_awaiting(&conn_id).await;
        if room.remove_member(&conn_id).await.is_none() {
            log::debug!("{conn_id} left room {} before joining it", room.name());
            return Some(room);
        }

        match self.oplog.update_member_count(room.name(), -1).await {
            Ok(meta) => {
                room.broadcast_from(
                    conn_id,
                    Push::NumMembersUpdate {
                        num_members: meta.num_members,
                    }
                    .into(),
                )
                .await;
            }
            Err(e) => {
                log::error!(
                    "[DATA OUT OF SYNC] Failed to decrement member count of room {}: {e}",
                    room.name()
                );
            }
        }

        log::info!("{} left room {}", client.display_name().await, room.name());
        Some(room)
    }

    /// Wipe a room's operation log and tell its live members to drop their
    /// local state.
    pub async fn clear_room(&self, name: &str) -> Result<RoomMetadata, LogError> {
        let meta = self.oplog.delete_all_operations(name).await?;
        if let Some(room) = self.rooms.get(name).await {
            let notified = room.broadcast(Push::ClearState.into(), &HashSet::new()).await;
            log::info!("Cleared room {name}, notified {notified} member(s)");
        }
        Ok(meta)
    }
}
