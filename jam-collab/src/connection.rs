//! Per-connection actor: one WebSocket, two loops.
//!
//! ```text
//!   socket ──► receive loop ──► spawn(dispatch) per frame
//!   socket ◄── transmit loop ◄── mailbox ◄── Client::send
//! ```
//! The receive loop never waits on a handler, so a slow handshake cannot
//! stall reads. When the socket ends, the client is closed exactly once and
//! the transmit loop drains what is left before the close handshake. A failed
//! write closes the client from the transmit side.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::client::Client;
use crate::dispatch::dispatch;
use crate::hub::Hub;
use crate::protocol::ServerMessage;

/// Drive one upgraded connection until the peer goes away.
pub async fn run_connection<S, P>(ws: WebSocketStream<S>, hub: Arc<Hub>, peer: P)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: Display + Send + Sync,
{
    let (client, mailbox) = hub.connect().await;
    let conn_id = client.conn_id();
    let (sink, mut stream) = ws.split();

    log::info!("Client {conn_id} connected from {peer}");

    let writer = tokio::spawn(transmit(sink, mailbox, Arc::clone(&hub), Arc::clone(&client)));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => spawn_dispatch(&hub, &client, text.as_bytes().to_vec()),
            Ok(Message::Binary(data)) => spawn_dispatch(&hub, &client, data.to_vec()),
            Ok(Message::Close(_)) => {
                log::info!("Connection closed by {peer}");
                break;
            }
            // Pings are answered by tungstenite
            Ok(_) => {}
            Err(e) => {
                log::error!("WebSocket error from {peer}: {e}");
                break;
            }
        }
    }

    client.close(&hub).await;
    if let Err(e) = writer.await {
        log::error!("Transmit loop of {conn_id} failed: {e}");
    }
}

fn spawn_dispatch(hub: &Arc<Hub>, client: &Arc<Client>, payload: Vec<u8>) {
    let hub = Arc::clone(hub);
    let client = Arc::clone(client);
    tokio::spawn(async move {
        hub.record_message(payload.len()).await;
        dispatch(&hub, &client, &payload).await;
    });
}

/// Write mailbox messages to `sink` until the mailbox closes or a write fails.
async fn transmit<K>(
    mut sink: K,
    mut mailbox: mpsc::Receiver<ServerMessage>,
    hub: Arc<Hub>,
    client: Arc<Client>,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let conn_id = client.conn_id();
    while let Some(message) = mailbox.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode message for {conn_id}: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            log::error!("Write to {conn_id} failed: {e}");
            client.close(&hub).await;
            return;
        }
    }

    // Mailbox closed and drained
    if let Err(e) = sink.send(Message::Close(None)).await {
        log::debug!("Close frame to {conn_id} not sent: {e}");
    }
    if let Err(e) = sink.close().await {
        log::debug!("Closing socket of {conn_id}: {e}");
    }
}
