//! JSON wire protocol between room clients and the sync server.
//!
//! Every frame is a single JSON object. Requests carry a `type` tag and an
//! optional correlation `id`:
//! ```text
//! { "id": "7", "type": "enterRoom", "roomName": "jam1" }
//! ```
//! Replies echo the `id` and carry no `type`. Server pushes carry a `type`
//! and no `id`:
//! ```text
//! { "id": "7", "roomDoc": { ... }, "operations": [ ... ] }
//! { "type": "numMembersUpdate", "numMembers": 3 }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::RoomMetadata;

/// An opaque operation record. Stored and replayed in commit order, never
/// interpreted by the server.
pub type Operation = Value;

/// Request tags understood by the dispatcher.
pub const REQUEST_TAGS: &[&str] = &[
    "announce",
    "enterRoom",
    "exitRoom",
    "operation",
    "operations",
    "state",
];

/// Client → server message body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Bind a user id to this connection
    Announce {
        #[serde(rename = "userID")]
        user_id: String,
    },
    /// Join a room, triggering state reconciliation
    EnterRoom {
        #[serde(rename = "roomName")]
        room_name: String,
    },
    /// Leave the current room
    ExitRoom,
    /// Submit a single operation
    Operation { operation: Operation },
    /// Submit a batch of operations, committed in order
    Operations { operations: Vec<Operation> },
    /// Full state pushed in answer to `requestState`
    State {
        state: Value,
        #[serde(rename = "roomName", default)]
        room_name: Option<String>,
    },
}

impl ClientMessage {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Announce { .. } => "announce",
            Self::EnterRoom { .. } => "enterRoom",
            Self::ExitRoom => "exitRoom",
            Self::Operation { .. } => "operation",
            Self::Operations { .. } => "operations",
            Self::State { .. } => "state",
        }
    }
}

/// A decoded request: correlation id plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Echoed verbatim in the reply (string or number, whatever the client sent)
    pub id: Option<Value>,
    pub message: ClientMessage,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl Request {
    /// Decode a raw frame.
    ///
    /// The envelope is read first so that an unknown tag is reported as
    /// [`ProtocolError::UnknownMessageType`] rather than a generic JSON error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let kind = envelope.kind.ok_or(ProtocolError::MissingType)?;
        if !REQUEST_TAGS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownMessageType {
                kind,
                id: envelope.id,
            });
        }
        let message = serde_json::from_slice(bytes).map_err(|source| {
            ProtocolError::InvalidBody {
                id: envelope.id.clone(),
                source,
            }
        })?;
        Ok(Self {
            id: envelope.id,
            message,
        })
    }
}

/// Correlated answer to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Reply {
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_doc: Option<RoomMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    /// Plain acknowledgement.
    pub fn ack(id: Option<Value>) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Error reply, sent to the requester only.
    pub fn error(id: Option<Value>, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Server-initiated notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Push {
    /// One committed operation from another member
    OperationUpdate { operation: Operation },
    /// A committed batch from another member
    OperationsUpdate { operations: Vec<Operation> },
    /// Ask this client for its full state
    RequestState,
    /// Discard local state (the room log was wiped)
    ClearState,
    /// Live member count changed
    NumMembersUpdate {
        #[serde(rename = "numMembers")]
        num_members: i64,
    },
}

/// Anything the server writes to a client.
///
/// `Push` is listed first so untagged decoding only falls back to `Reply`
/// when there is no `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Push(Push),
    Reply(Reply),
}

impl ServerMessage {
    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame written by the server (client side and tests).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn as_push(&self) -> Option<&Push> {
        match self {
            Self::Push(push) => Some(push),
            Self::Reply(_) => None,
        }
    }

    pub fn as_reply(&self) -> Option<&Reply> {
        match self {
            Self::Reply(reply) => Some(reply),
            Self::Push(_) => None,
        }
    }
}

impl From<Push> for ServerMessage {
    fn from(push: Push) -> Self {
        Self::Push(push)
    }
}

impl From<Reply> for ServerMessage {
    fn from(reply: Reply) -> Self {
        Self::Reply(reply)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no type")]
    MissingType,
    #[error("message type \"{kind}\" not implemented")]
    UnknownMessageType { kind: String, id: Option<Value> },
    #[error("invalid message body: {source}")]
    InvalidBody {
        id: Option<Value>,
        source: serde_json::Error,
    },
}
