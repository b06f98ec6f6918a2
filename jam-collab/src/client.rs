//! Server-side connection handle.
//!
//! A `Client` is the non-blocking face of one WebSocket connection:
//! ```text
//!   handlers ── send() ──► [bounded mailbox] ──► transmit loop ──► socket
//!                              (timeout)
//!   joiner ── wait_for_full_state() ◄── oneshot ◄── deliver_full_state() ── peer
//! ```
//! Nothing outside `connection` touches the socket itself, so a slow peer can
//! only ever cost its senders one mailbox timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::hub::{Hub, HubConfig};
use crate::protocol::ServerMessage;
use crate::room::Room;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("send on closed connection")]
    SendOnClosed,
    #[error("no state received within {0:?}")]
    StateTimeout(Duration),
    #[error("client is not in a room")]
    NotInRoom,
    #[error("client is closed")]
    Closed,
}

/// One connected client.
#[derive(Debug)]
pub struct Client {
    conn_id: Uuid,
    user_id: RwLock<Option<String>>,
    /// Room this client is joined to, or joining
    room: Mutex<Option<Arc<Room>>>,
    /// `None` once the connection is closed
    mailbox: StdMutex<Option<mpsc::Sender<ServerMessage>>>,
    closed: AtomicBool,
    /// Armed while this client waits for a peer's full state
    state_slot: StdMutex<Option<oneshot::Sender<Value>>>,
    send_timeout: Duration,
}

impl Client {
    /// Create a client and the receiving end of its mailbox.
    pub fn new(config: &HubConfig) -> (Arc<Self>, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let client = Arc::new(Self {
            conn_id: Uuid::new_v4(),
            user_id: RwLock::new(None),
            room: Mutex::new(None),
            mailbox: StdMutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            state_slot: StdMutex::new(None),
            send_timeout: config.send_timeout,
        });
        (client, rx)
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub async fn user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }

    pub async fn set_user_id(&self, user_id: impl Into<String>) {
        *self.user_id.write().await = Some(user_id.into());
    }

    /// Name used in log lines: the announced user id, else the connection id.
    pub async fn display_name(&self) -> String {
        match self.user_id().await {
            Some(user_id) => user_id,
            None => self.conn_id.to_string(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Mailbox ──────────────────────────────────────────────────────

    fn sender(&self) -> Option<mpsc::Sender<ServerMessage>> {
        self.mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue a message for this client.
    ///
    /// Waits up to the configured send timeout when the mailbox is full.
    pub async fn send(&self, message: impl Into<ServerMessage>) -> Result<(), ClientError> {
        let sender = self.sender().ok_or(ClientError::SendOnClosed)?;
        sender
            .send_timeout(message.into(), self.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ClientError::SendTimeout(self.send_timeout),
                SendTimeoutError::Closed(_) => ClientError::SendOnClosed,
            })
    }

    // ─── Room reference ───────────────────────────────────────────────

    pub async fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().await.clone()
    }

    /// Hold the room reference while checking or changing it together with
    /// the room's member set.
    pub async fn lock_room(&self) -> MutexGuard<'_, Option<Arc<Room>>> {
        self.room.lock().await
    }

    /// Point this client at `room`, returning the previous reference.
    ///
    /// Refused once the client is closed, so a late join cannot outlive it.
    pub async fn attach_room(&self, room: Arc<Room>) -> Result<Option<Arc<Room>>, ClientError> {
        let mut current = self.room.lock().await;
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(current.replace(room))
    }

    /// Clear the room reference if it still points at `room`.
    pub async fn detach_room(&self, room: &Arc<Room>) -> bool {
        let mut current = self.room.lock().await;
        match current.as_ref() {
            Some(existing) if Arc::ptr_eq(existing, room) => {
                current.take();
                true
            }
            _ => false,
        }
    }

    pub async fn take_room(&self) -> Option<Arc<Room>> {
        self.room.lock().await.take()
    }

    // ─── Full-state rendezvous ────────────────────────────────────────

    fn state_slot(&self) -> StdMutexGuard<'_, Option<oneshot::Sender<Value>>> {
        self.state_slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the state slot and register in the room's awaiting set.
    ///
    /// Split from waiting so the registration is in place before the peer is
    /// asked for its state.
    pub async fn expect_full_state(self: &Arc<Self>) -> Result<PendingState, ClientError> {
        let room = self.room().await.ok_or(ClientError::NotInRoom)?;
        let (tx, rx) = oneshot::channel();
        *self.state_slot() = Some(tx);
        room.await_state(Arc::clone(self)).await;
        Ok(PendingState {
            client: Arc::clone(self),
            room,
            rx,
        })
    }

    /// Wait for a peer to deliver the room's full state.
    pub async fn wait_for_full_state(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.expect_full_state().await?.wait(timeout).await
    }

    /// Hand `state` to this client if it is waiting for one. Never blocks.
    pub fn deliver_full_state(&self, state: Value) -> bool {
        match self.state_slot().take() {
            Some(tx) => {
                if tx.send(state).is_err() {
                    log::warn!("State for {} arrived after its wait ended", self.conn_id);
                    return false;
                }
                true
            }
            None => {
                log::warn!("Dropped state for {}: not waiting", self.conn_id);
                false
            }
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Tear the client down. Only the first call has any effect.
    ///
    /// Closes the mailbox, leaves the current room and deregisters.
    pub async fn close(self: &Arc<Self>, hub: &Hub) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state_slot().take();

        hub.leave_room(self).await;
        hub.clients().remove(&self.conn_id).await;

        log::info!("Closed client {}", self.display_name().await);
    }
}

/// A registered state wait, produced by [`Client::expect_full_state`].
pub struct PendingState {
    client: Arc<Client>,
    room: Arc<Room>,
    rx: oneshot::Receiver<Value>,
}

impl PendingState {
    /// Wait up to `timeout`, then deregister whatever the outcome.
    pub async fn wait(self, timeout: Duration) -> Result<Value, ClientError> {
        let result = tokio::time::timeout(timeout, self.rx).await;
        self.room.stop_awaiting(&self.client.conn_id).await;
        self.client.state_slot().take();

        match result {
            Ok(Ok(state)) => Ok(state),
            // Timed out, or the slot was re-armed or torn down
            Ok(Err(_)) | Err(_) => Err(ClientError::StateTimeout(timeout)),
        }
    }

    /// Deregister without waiting.
    pub async fn cancel(self) {
        self.room.stop_awaiting(&self.client.conn_id).await;
        self.client.state_slot().take();
    }
}

/// Client registry: connection id → [`Client`].
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<Uuid, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, client: Arc<Client>) {
        self.clients.write().await.insert(client.conn_id(), client);
    }

    pub async fn remove(&self, conn_id: &Uuid) -> Option<Arc<Client>> {
        self.clients.write().await.remove(conn_id)
    }

    pub async fn get(&self, conn_id: &Uuid) -> Option<Arc<Client>> {
        self.clients.read().await.get(conn_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
