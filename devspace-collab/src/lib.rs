//! # devspace-collab: real-time collaborative editing core
//!
//! Keeps one shared text document per open file converged across every
//! editor that has it open, and shows each collaborator's cursor to the
//! others.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   WebSocket    ┌──────────────────┐
//! │ SessionController│ ◄────────────► │ SyncServer       │
//! │ (per editor)     │  Binary Proto  │ (relay)          │
//! └────────┬─────────┘                └────────┬─────────┘
//!          │ one driver task per document      │ one room per document
//!          ▼                                   ▼
//! ┌──────────────────┐                ┌──────────────────┐
//! │ Session          │                │ ReplicaStore     │
//! │  ReplicaStore    │                │ BroadcastGroup   │
//! │  SyncTransport   │                └──────────────────┘
//! │  AwarenessChannel│
//! │  CursorProjector │
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`replica`] - Replicated text (operation log, state vector, causal buffering)
//! - [`transport`] - Connection state machine, backoff and heartbeat
//! - [`awareness`] - Ephemeral presence records
//! - [`cursor`] - Remote selections mapped to editor decorations
//! - [`session`] - Sans-IO per-document session core
//! - [`controller`] - Async session driver and editor-facing handles
//! - [`connector`] - Network seam (`Connector`, WebSocket implementation)
//! - [`protocol`] - Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`] - Relay rooms with fan-out and backpressure
//! - [`server`] - WebSocket relay

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod connector;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use awareness::{AwarenessChannel, AwarenessRecord, CursorColor, Selection};
pub use broadcast::{BroadcastGroup, BroadcastStats, Room, RoomManager};
pub use config::CollabConfig;
pub use connector::{Connector, Link, WsConnector};
pub use controller::{SessionController, SessionHandle};
pub use cursor::{CursorDecoration, CursorProjector, DecorationChange, LineColumn};
pub use error::{ConfigError, ProtocolError, ReplicaError, SessionError, TransportError};
pub use protocol::{MessageType, RoomKey, SyncMessage};
pub use replica::{DocumentId, OpId, Operation, RelativePosition, ReplicaId, ReplicaStore, StateVector};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionEvent, SessionStatus};
pub use transport::{Backoff, ConnectionState, SyncTransport};
