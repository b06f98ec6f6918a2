//! # jam-collab — Room synchronization and operation-log engine
//!
//! Clients connect over WebSocket, join named rooms and exchange opaque
//! operations. The only durable record of a room is its append-only,
//! bucketed operation log; a joining client is brought up to date either
//! with a live peer's full state or by replaying that log.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON frames    ┌──────────────┐   route by type   ┌──────────────┐
//! │ WebSocket   │ ───────────────► │ connection   │ ────────────────► │ dispatch     │
//! │ (per user)  │ ◄─────────────── │ (actor)      │                   │ + reconcile  │
//! └─────────────┘   mailbox        └──────┬───────┘                   └──────┬───────┘
//!                                         │                                  │
//!                                         ▼                                  ▼
//!                                  ┌─────────────┐                   ┌──────────────┐
//!                                  │ Hub         │                   │ OperationLog │
//!                                  │ clients     │                   │ (buckets)    │
//!                                  │ rooms       │                   └──────┬───────┘
//!                                  └─────────────┘                          ▼
//!                                                                    ┌──────────────┐
//!                                                                    │ RoomStore    │
//!                                                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (requests, replies, pushes)
//! - [`client`] — Connection handle: mailbox, room reference, state slot
//! - [`room`] — Room membership and fan-out
//! - [`hub`] — Registries and the operation log, shared by all connections
//! - [`reconcile`] — Join handshake (peer state or log replay)
//! - [`dispatch`] — Request handlers
//! - [`oplog`] — Bucketed operation log
//! - [`storage`] — Room store trait, in-memory and RocksDB stores
//! - [`directory`] — Which room names exist
//! - [`connection`] — Per-socket receive and transmit loops
//! - [`server`] — WebSocket accept loop and configuration

pub mod protocol;
pub mod client;
pub mod room;
pub mod hub;
pub mod reconcile;
pub mod dispatch;
pub mod oplog;
pub mod storage;
pub mod directory;
pub mod connection;
pub mod server;

// Re-exports for convenience
pub use protocol::{ClientMessage, Operation, ProtocolError, Push, Reply, Request, ServerMessage};
pub use client::{Client, ClientError, ClientRegistry, PendingState};
pub use room::{BroadcastStats, Room, RoomRegistry};
pub use hub::{Hub, HubConfig, HubStats};
pub use reconcile::{enter_room, JoinView, Joined};
pub use dispatch::{dispatch, HandlerError};
pub use oplog::{LogConfig, LogError, OperationLog};
pub use storage::{
    AppendOutcome, MemoryRoomStore, OperationBucket, RocksRoomStore, RoomMetadata, RoomStore,
    StoreConfig, StoreError, FIRST_BUCKET,
};
pub use directory::{DirectoryError, OpenDirectory, RoomDirectory, RoomProfile, StaticDirectory};
pub use connection::run_connection;
pub use server::{ConfigError, ServerConfig, ServerError, SyncServer};
