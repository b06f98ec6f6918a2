//! Join handshake: bring a joining client up to date with its room.
//!
//! ```text
//!  joiner                 hub / room                      random member
//!    │  enterRoom            │                                  │
//!    │──────────────────────►│ attach room (not yet a member)   │
//!    │                       │ register in awaiting_state       │
//!    │                       │────────── requestState ─────────►│
//!    │                       │◄───────────── state ─────────────│
//!    │                       │  (or timeout → replay the log)   │
//!    │                       │ num_members += 1                 │
//!    │                       │ numMembersUpdate → members       │
//!    │                       │ add joiner to members            │
//!    │◄── {roomDoc, state | operations} ─────                   │
//! ```
//!
//! The joiner only becomes a member once its view is settled, so it never
//! receives an `operationUpdate` for an operation already contained in its
//! initial view.

use std::sync::Arc;

use serde_json::Value;

use crate::client::Client;
use crate::dispatch::HandlerError;
use crate::hub::Hub;
use crate::protocol::{Operation, Push, Reply};
use crate::storage::RoomMetadata;

/// The initial view handed to a joining client.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinView {
    /// Full state pulled from a live member
    State(Value),
    /// The room's whole operation log
    Operations(Vec<Operation>),
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
    pub room: RoomMetadata,
    pub view: JoinView,
}

impl Joined {
    pub fn into_reply(self) -> Reply {
        let mut reply = Reply {
            room_doc: Some(self.room),
            ..Reply::default()
        };
        match self.view {
            JoinView::State(state) => reply.state = Some(state),
            JoinView::Operations(operations) => reply.operations = Some(operations),
        }
        reply
    }
}

/// Move `client` into the room called `name`.
///
/// A client already in a room leaves it first, even when it is the same room.
pub async fn enter_room(
    hub: &Hub,
    client: &Arc<Client>,
    name: &str,
) -> Result<Joined, HandlerError> {
    let mut meta = hub.oplog().room(name).await?;
    let room = hub.rooms().get_or_create(name).await;

    if let Some(previous) = hub.leave_room(client).await {
        log::debug!(
            "{} moving from room {} to {name}",
            client.display_name().await,
            previous.name()
        );
    }
    client.attach_room(room.clone()).await?;

    let peer_state = match room.pick_random_member().await {
        Some(peer) => request_state(hub, client, &peer).await,
        None => None,
    };

    let view = match peer_state {
        Some(state) => JoinView::State(state),
        None => match hub.oplog().get_all_operations(name).await {
            Ok(operations) => JoinView::Operations(operations),
            Err(e) => {
                client.detach_room(&room).await;
                return Err(e.into());
            }
        },
    };

    // Hold the room reference so a concurrent close either happens before
    // this check or after the client is a full member
    let slot = client.lock_room().await;
    match slot.as_ref() {
        Some(current) if Arc::ptr_eq(current, &room) && !client.is_closed() => {}
        _ => return Err(HandlerError::Detached(name.to_string())),
    }

    match hub.oplog().update_member_count(name, 1).await {
        Ok(updated) => meta = updated,
        Err(e) => {
            log::error!("[DATA OUT OF SYNC] Failed to increment member count of room {name}: {e}");
        }
    }

    room.broadcast_from(
        client.conn_id(),
        Push::NumMembersUpdate {
            num_members: meta.num_members,
        }
        .into(),
    )
    .await;
    room.add_member(client.clone()).await;
    drop(slot);

    log::info!(
        "{} joined room {name} ({} member(s))",
        client.display_name().await,
        meta.num_members
    );

    Ok(Joined { room: meta, view })
}

/// Ask `peer` for its state on behalf of `client`. `None` means fall back to
/// the operation log.
async fn request_state(hub: &Hub, client: &Arc<Client>, peer: &Arc<Client>) -> Option<Value> {
    let pending = match client.expect_full_state().await {
        Ok(pending) => pending,
        Err(e) => {
            log::warn!("Cannot wait for state: {e}");
            return None;
        }
    };

    if let Err(e) = peer.send(Push::RequestState).await {
        log::warn!("Failed to request state from {}: {e}", peer.conn_id());
        pending.cancel().await;
        return None;
    }

    match pending.wait(hub.config().state_timeout).await {
        Ok(Value::Null) => {
            log::warn!("{} answered requestState with null", peer.conn_id());
            None
        }
        Ok(state) => Some(state),
        Err(e) => {
            log::warn!("{e} from {}, replaying the operation log", peer.conn_id());
            None
        }
    }
}
