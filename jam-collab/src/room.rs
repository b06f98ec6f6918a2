//! In-memory rooms: membership, state waiters and fan-out.
//!
//! A room fans a message out to N-1 members by sending into each member's
//! mailbox concurrently. A slow or dead member costs at most one send
//! timeout and never blocks the others.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use rand::seq::IteratorRandom;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::Client;
use crate::protocol::ServerMessage;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Delivery counters, updated without taking the membership lock.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A named room.
///
/// A client is in `members` only after its join handshake has finished.
/// `awaiting_state` holds the joiners currently waiting for a peer's state.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: RwLock<HashMap<Uuid, Arc<Client>>>,
    awaiting_state: RwLock<HashMap<Uuid, Arc<Client>>>,
    stats: AtomicBroadcastStats,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
            awaiting_state: RwLock::new(HashMap::new()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ─── Membership ───────────────────────────────────────────────────

    pub async fn add_member(&self, client: Arc<Client>) {
        self.members.write().await.insert(client.conn_id(), client);
    }

    pub async fn remove_member(&self, conn_id: &Uuid) -> Option<Arc<Client>> {
        self.members.write().await.remove(conn_id)
    }

    pub async fn has_member(&self, conn_id: &Uuid) -> bool {
        self.members.read().await.contains_key(conn_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of the current members.
    pub async fn members(&self) -> Vec<Arc<Client>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Any live member, chosen uniformly.
    pub async fn pick_random_member(&self) -> Option<Arc<Client>> {
        let members = self.members.read().await;
        members.values().choose(&mut rand::rng()).cloned()
    }

    // ─── State waiters ────────────────────────────────────────────────

    pub async fn await_state(&self, client: Arc<Client>) {
        self.awaiting_state
            .write()
            .await
            .insert(client.conn_id(), client);
    }

    pub async fn stop_awaiting(&self, conn_id: &Uuid) {
        self.awaiting_state.write().await.remove(conn_id);
    }

    /// Snapshot of the clients waiting for a full state push.
    pub async fn awaiting_state(&self) -> Vec<Arc<Client>> {
        self.awaiting_state.read().await.values().cloned().collect()
    }

    // ─── Fan-out ──────────────────────────────────────────────────────

    /// Send `message` to every member not in `exclude`.
    ///
    /// Sends run concurrently against a snapshot of the member set. Failed
    /// deliveries are logged and counted, never returned. Returns the number
    /// of members that accepted the message.
    pub async fn broadcast(&self, message: ServerMessage, exclude: &HashSet<Uuid>) -> usize {
        let recipients: Vec<Arc<Client>> = self
            .members
            .read()
            .await
            .values()
            .filter(|client| !exclude.contains(&client.conn_id()))
            .cloned()
            .collect();

        let sends = recipients.iter().map(|client| {
            let message = message.clone();
            async move { (client.conn_id(), client.send(message).await) }
        });

        let mut delivered = 0;
        for (conn_id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::error!("Broadcast to {conn_id} in room {} failed: {e}", self.name);
                }
            }
        }

        self.stats
            .messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Send `message` to every member except `sender`.
    pub async fn broadcast_from(&self, sender: Uuid, message: ServerMessage) -> usize {
        self.broadcast(message, &HashSet::from([sender])).await
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }
}

/// Room registry: room name → [`Room`].
///
/// Rooms are created on first join and live for the rest of the process.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room with the given name.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }

        log::debug!("Created room {name}");
        let room = Arc::new(Room::new(name));
        rooms.insert(name.to_string(), room.clone());
        room
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
