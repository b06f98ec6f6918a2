//! Request routing and protocol handlers.
//!
//! Every request gets exactly one correlated reply on the requester's own
//! mailbox (`state` without an `id` excepted). Effects on other clients go
//! out as room broadcasts that exclude the requester.

use std::sync::Arc;

use serde_json::Value;

use crate::client::{Client, ClientError};
use crate::hub::Hub;
use crate::oplog::LogError;
use crate::protocol::{ClientMessage, Operation, ProtocolError, Push, Reply, Request};
use crate::reconcile;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error("user {user} is not in a room to {action}")]
    NotInRoom { user: String, action: &'static str },
    #[error("left room \"{0}\" before joining it")]
    Detached(String),
}

async fn not_in_room(client: &Client, action: &'static str) -> HandlerError {
    HandlerError::NotInRoom {
        user: client.display_name().await,
        action,
    }
}

/// Decode one inbound frame and run its handler.
///
/// Undecodable frames and unknown message types are logged and dropped. A
/// known type with a malformed body is answered with an error reply.
pub async fn dispatch(hub: &Hub, client: &Arc<Client>, payload: &[u8]) {
    let request = match Request::decode(payload) {
        Ok(request) => request,
        Err(ProtocolError::UnknownMessageType { kind, .. }) => {
            log::warn!("Message type \"{kind}\" from {} not implemented", client.conn_id());
            return;
        }
        Err(ProtocolError::InvalidBody { id, source }) => {
            log::warn!("Malformed message from {}: {source}", client.conn_id());
            let reply = Reply::error(id, format!("invalid message: {source}"));
            if let Err(e) = client.send(reply).await {
                log::warn!("Reply to {} lost: {e}", client.conn_id());
            }
            return;
        }
        Err(e) => {
            log::warn!("Failed to decode message from {}: {e}", client.conn_id());
            return;
        }
    };

    let kind = request.message.kind();
    log::debug!("{} from {}", kind, client.conn_id());

    let silent = matches!(request.message, ClientMessage::State { .. }) && request.id.is_none();
    let id = request.id;

    let reply = match handle(hub, client, request.message).await {
        Ok(mut reply) => {
            reply.id = id;
            reply
        }
        Err(e) => {
            log::warn!("{kind} from {} failed: {e}", client.conn_id());
            Reply::error(id, e.to_string())
        }
    };

    if silent && !reply.is_error() {
        return;
    }
    if let Err(e) = client.send(reply).await {
        log::warn!("Reply to {} lost: {e}", client.conn_id());
    }
}

/// Run the handler for `message`. The returned reply has no `id` yet.
pub async fn handle(
    hub: &Hub,
    client: &Arc<Client>,
    message: ClientMessage,
) -> Result<Reply, HandlerError> {
    match message {
        ClientMessage::Announce { user_id } => {
            log::info!("{} announced as {user_id}", client.conn_id());
            client.set_user_id(user_id).await;
            Ok(Reply::default())
        }
        ClientMessage::EnterRoom { room_name } => {
            let joined = reconcile::enter_room(hub, client, &room_name).await?;
            Ok(joined.into_reply())
        }
        ClientMessage::ExitRoom => exit_room(hub, client).await,
        ClientMessage::Operation { operation } => {
            let pushed = Push::OperationUpdate {
                operation: operation.clone(),
            };
            commit(hub, client, vec![operation], pushed).await
        }
        ClientMessage::Operations { operations } => {
            let pushed = Push::OperationsUpdate {
                operations: operations.clone(),
            };
            commit(hub, client, operations, pushed).await
        }
        ClientMessage::State { state, room_name } => {
            deliver_state(hub, client, state, room_name).await
        }
    }
}

async fn exit_room(hub: &Hub, client: &Arc<Client>) -> Result<Reply, HandlerError> {
    match hub.leave_room(client).await {
        Some(_) => Ok(Reply::default()),
        None => Err(not_in_room(client, "exit").await),
    }
}

async fn commit(
    hub: &Hub,
    client: &Arc<Client>,
    operations: Vec<Operation>,
    pushed: Push,
) -> Result<Reply, HandlerError> {
    let room = match client.room().await {
        Some(room) => room,
        None => return Err(not_in_room(client, "submit operations").await),
    };

    hub.oplog()
        .commit_operations(room.name(), &operations)
        .await?;

    if !operations.is_empty() {
        room.broadcast_from(client.conn_id(), pushed.into()).await;
    }
    Ok(Reply::default())
}

/// Fan a full state out to everyone in the room waiting for one.
async fn deliver_state(
    hub: &Hub,
    client: &Arc<Client>,
    state: Value,
    room_name: Option<String>,
) -> Result<Reply, HandlerError> {
    let room = match client.room().await {
        Some(room) => Some(room),
        None => match room_name {
            Some(name) => hub.rooms().get(&name).await,
            None => None,
        },
    };
    let Some(room) = room else {
        return Err(not_in_room(client, "send state").await);
    };

    let waiters = room.awaiting_state().await;
    let delivered = waiters
        .iter()
        .filter(|waiter| waiter.deliver_full_state(state.clone()))
        .count();
    log::debug!(
        "State from {} delivered to {delivered}/{} waiter(s) in room {}",
        client.conn_id(),
        waiters.len(),
        room.name()
    );
    Ok(Reply::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubConfig;
    use crate::oplog::LogConfig;
    use crate::protocol::ServerMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_hub() -> Arc<Hub> {
        Arc::new(Hub::with_memory_store(
            HubConfig::for_testing(),
            LogConfig::default(),
        ))
    }

    async fn send(hub: &Hub, client: &Arc<Client>, frame: Value) {
        dispatch(hub, client, frame.to_string().as_bytes()).await;
    }

    async fn next_reply(rx: &mut mpsc::Receiver<ServerMessage>) -> Reply {
        loop {
            match rx.recv().await {
                Some(ServerMessage::Reply(reply)) => return reply,
                Some(ServerMessage::Push(_)) => continue,
                None => panic!("mailbox closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_announce_acks_and_sets_user() {
        let hub = test_hub();
        let (alice, mut rx) = hub.connect().await;
        send(&hub, &alice, json!({"id": "1", "type": "announce", "userID": "alice"})).await;

        assert_eq!(rx.recv().await, Some(Reply::ack(Some(json!("1"))).into()));
        assert_eq!(alice.user_id().await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_unknown_and_garbage_frames_ignored() {
        let hub = test_hub();
        let (alice, mut rx) = hub.connect().await;
        send(&hub, &alice, json!({"id": "1", "type": "dance"})).await;
        dispatch(&hub, &alice, b"{{{").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_known_type_gets_error_reply() {
        let hub = test_hub();
        let (alice, mut rx) = hub.connect().await;

        for frame in [
            json!({"id": "1", "type": "enterRoom"}),
            json!({"id": "2", "type": "operation"}),
            json!({"id": "3", "type": "announce", "userID": 5}),
        ] {
            let id = frame["id"].clone();
            send(&hub, &alice, frame).await;
            let reply = next_reply(&mut rx).await;
            assert_eq!(reply.id, Some(id));
            assert!(reply.is_error());
        }
        assert!(alice.room().await.is_none());
        assert!(alice.user_id().await.is_none());
    }

    #[tokio::test]
    async fn test_enter_room_reply() {
        let hub = test_hub();
        let (alice, mut rx) = hub.connect().await;
        send(&hub, &alice, json!({"id": "2", "type": "enterRoom", "roomName": "jam1"})).await;

        let reply = next_reply(&mut rx).await;
        assert_eq!(reply.id, Some(json!("2")));
        assert_eq!(reply.room_doc.unwrap().num_members, 1);
        assert_eq!(reply.operations, Some(vec![]));
        assert!(reply.state.is_none());
    }

    #[tokio::test]
    async fn test_exit_room_requires_room() {
        let hub = test_hub();
        let (alice, mut rx) = hub.connect().await;
        send(&hub, &alice, json!({"id": "3", "type": "announce", "userID": "alice"})).await;
        next_reply(&mut rx).await;

        send(&hub, &alice, json!({"id": "4", "type": "exitRoom"})).await;
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply.id, Some(json!("4")));
        assert_eq!(reply.error.as_deref(), Some("user alice is not in a room to exit"));
    }

    #[tokio::test]
    async fn test_exit_room_notifies_remaining() {
        let hub = test_hub();
        let (alice, mut rx_a) = hub.connect().await;
        let (bob, mut rx_b) = hub.connect().await;
        reconcile::enter_room(&hub, &alice, "jam1").await.unwrap();
        reconcile::enter_room(&hub, &bob, "jam1").await.unwrap();
        // Drain the handshake traffic
        while rx_a.try_recv().is_ok() {}

        send(&hub, &bob, json!({"id": "5", "type": "exitRoom"})).await;
        assert_eq!(next_reply(&mut rx_b).await, Reply::ack(Some(json!("5"))));
        assert_eq!(
            rx_a.recv().await,
            Some(Push::NumMembersUpdate { num_members: 1 }.into())
        );
    }

    #[tokio::test]
    async fn test_operation_requires_room() {
        let hub = test_hub();
        let (alice, mut rx) = hub.connect().await;
        send(&hub, &alice, json!({"id": "6", "type": "operation", "operation": {"pitch": 60}})).await;

        let reply = next_reply(&mut rx).await;
        assert!(reply.is_error());
        assert!(hub.oplog().get_all_operations("jam1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operation_commits_and_broadcasts_to_others() {
        let hub = test_hub();
        let (alice, mut rx_a) = hub.connect().await;
        let (bob, mut rx_b) = hub.connect().await;
        reconcile::enter_room(&hub, &alice, "jam1").await.unwrap();
        reconcile::enter_room(&hub, &bob, "jam1").await.unwrap();
        while rx_a.try_recv().is_ok() {}

        let op = json!({"type": "note", "pitch": 60});
        send(&hub, &alice, json!({"id": "7", "type": "operation", "operation": op})).await;

        assert_eq!(rx_a.recv().await, Some(Reply::ack(Some(json!("7"))).into()));
        assert_eq!(
            rx_b.recv().await,
            Some(Push::OperationUpdate { operation: op.clone() }.into())
        );
        assert!(rx_a.try_recv().is_err());
        assert_eq!(hub.oplog().get_all_operations("jam1").await.unwrap(), vec![op]);
    }

    #[tokio::test]
    async fn test_operations_batch_broadcast() {
        let hub = test_hub();
        let (alice, mut rx_a) = hub.connect().await;
        let (bob, mut rx_b) = hub.connect().await;
        reconcile::enter_room(&hub, &alice, "jam1").await.unwrap();
        reconcile::enter_room(&hub, &bob, "jam1").await.unwrap();
        while rx_a.try_recv().is_ok() {}

        let ops = vec![json!(1), json!(2), json!(3)];
        send(&hub, &bob, json!({"id": 8, "type": "operations", "operations": ops})).await;

        assert_eq!(next_reply(&mut rx_b).await, Reply::ack(Some(json!(8))));
        assert_eq!(
            rx_a.recv().await,
            Some(Push::OperationsUpdate { operations: ops.clone() }.into())
        );
        assert_eq!(hub.oplog().get_all_operations("jam1").await.unwrap(), ops);
    }

    #[tokio::test]
    async fn test_state_fans_out_to_every_waiter() {
        let hub = test_hub();
        let room = hub.rooms().get_or_create("jam1").await;
        let (alice, mut rx_a) = hub.connect().await;
        alice.attach_room(room.clone()).await.unwrap();
        room.add_member(alice.clone()).await;

        let (bob, _rx_b) = hub.connect().await;
        let (carol, _rx_c) = hub.connect().await;
        bob.attach_room(room.clone()).await.unwrap();
        carol.attach_room(room.clone()).await.unwrap();
        let pending_b = bob.expect_full_state().await.unwrap();
        let pending_c = carol.expect_full_state().await.unwrap();

        send(&hub, &alice, json!({"type": "state", "state": {"notes": [60]}})).await;

        let timeout = hub.config().state_timeout;
        assert_eq!(pending_b.wait(timeout).await.unwrap(), json!({"notes": [60]}));
        assert_eq!(pending_c.wait(timeout).await.unwrap(), json!({"notes": [60]}));
        // No id, no reply
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_state_uses_room_name_fallback() {
        let hub = test_hub();
        let room = hub.rooms().get_or_create("jam1").await;
        let (joiner, _rx_j) = hub.connect().await;
        joiner.attach_room(room.clone()).await.unwrap();
        let pending = joiner.expect_full_state().await.unwrap();

        let (outsider, mut rx_o) = hub.connect().await;
        send(
            &hub,
            &outsider,
            json!({"id": "9", "type": "state", "state": [1], "roomName": "jam1"}),
        )
        .await;

        assert_eq!(pending.wait(hub.config().state_timeout).await.unwrap(), json!([1]));
        assert_eq!(next_reply(&mut rx_o).await, Reply::ack(Some(json!("9"))));
    }
}
