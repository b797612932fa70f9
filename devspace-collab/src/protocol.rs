//! Binary protocol for replica synchronization and awareness.
//!
//! Wire format (bincode-encoded envelope):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────────────────────┐
//! │ msg_type │ sender    │ compressed │ payload                  │
//! │ 1 byte   │ 16 bytes  │ 1 byte     │ bincode (LZ4 if large)   │
//! └──────────┴───────────┴────────────┴──────────────────────────┘
//! ```
//!
//! One channel exists per document; its room key is derived from the
//! document id, so unrelated documents never share a channel.

use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::awareness::AwarenessRecord;
use crate::error::ProtocolError;
use crate::replica::{DocumentId, Operation, ReplicaId, StateVector};

/// Payloads above this size are LZ4-compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const ROOM_PREFIX: &str = "codespace-";

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender's state vector; the receiver answers with what it is missing.
    SyncRequest = 1,
    /// Operations the requester lacks plus the responder's state vector.
    SyncResponse = 2,
    /// Incremental operations
    Update = 3,
    /// Full replacement of the sender's awareness record
    Awareness = 4,
    /// Sender's awareness record is gone (clean close or relay-detected drop)
    Leave = 5,
    Ping = 6,
    Pong = 7,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::SyncRequest => "sync-request",
            MessageType::SyncResponse => "sync-response",
            MessageType::Update => "update",
            MessageType::Awareness => "awareness",
            MessageType::Leave => "leave",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

/// Channel name for one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn for_document(document_id: &DocumentId) -> Self {
        Self(format!("{ROOM_PREFIX}{document_id}"))
    }

    /// Wrap a key received from the network (e.g. a URL path segment).
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// WebSocket URL of this room on a relay at `server_url`.
    pub fn url(&self, server_url: &str) -> String {
        format!("{}/{}", server_url.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize)]
struct SyncResponsePayload {
    operations: Vec<Operation>,
    state_vector: StateVector,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Replica (for document traffic) or awareness client (for presence) id.
    pub sender: ReplicaId,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        sender: ReplicaId,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let (compressed, payload) = if raw.len() > COMPRESSION_THRESHOLD {
            (true, lz4_flex::compress_prepend_size(&raw))
        } else {
            (false, raw)
        };
        Ok(Self {
            msg_type,
            sender,
            compressed,
            payload,
        })
    }

    fn empty(msg_type: MessageType, sender: ReplicaId) -> Self {
        Self {
            msg_type,
            sender,
            compressed: false,
            payload: Vec::new(),
        }
    }

    pub fn sync_request(sender: ReplicaId, state_vector: &StateVector) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::SyncRequest, sender, state_vector)
    }

    pub fn sync_response(
        sender: ReplicaId,
        operations: Vec<Operation>,
        state_vector: StateVector,
    ) -> Result<Self, ProtocolError> {
        let payload = SyncResponsePayload {
            operations,
            state_vector,
        };
        Self::with_payload(MessageType::SyncResponse, sender, &payload)
    }

    pub fn update(sender: ReplicaId, operations: &[Operation]) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Update, sender, &operations)
    }

    pub fn awareness(record: &AwarenessRecord) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Awareness, record.client_id, record)
    }

    pub fn leave(client_id: ReplicaId) -> Self {
        Self::empty(MessageType::Leave, client_id)
    }

    pub fn ping(sender: ReplicaId) -> Self {
        Self::empty(MessageType::Ping, sender)
    }

    pub fn pong(sender: ReplicaId) -> Self {
        Self::empty(MessageType::Pong, sender)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn payload_bytes(&self) -> Result<Cow<'_, [u8]>, ProtocolError> {
        if self.compressed {
            lz4_flex::decompress_size_prepended(&self.payload)
                .map(Cow::Owned)
                .map_err(|e| ProtocolError::Decompression(e.to_string()))
        } else {
            Ok(Cow::Borrowed(&self.payload))
        }
    }

    fn decode_payload<T: DeserializeOwned>(&self, expected: &[MessageType]) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType {
                expected: expected[0].name(),
                got: self.msg_type.name(),
            });
        }
        let bytes = self.payload_bytes()?;
        let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    /// Parse a sync-request payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        self.decode_payload(&[MessageType::SyncRequest])
    }

    /// Parse a sync-response payload.
    pub fn sync_payload(&self) -> Result<(Vec<Operation>, StateVector), ProtocolError> {
        let payload: SyncResponsePayload = self.decode_payload(&[MessageType::SyncResponse])?;
        Ok((payload.operations, payload.state_vector))
    }

    /// Operations carried by an update or a sync-response.
    pub fn operations(&self) -> Result<Vec<Operation>, ProtocolError> {
        if self.msg_type == MessageType::SyncResponse {
            return self.sync_payload().map(|(ops, _)| ops);
        }
        self.decode_payload(&[MessageType::Update])
    }

    /// Parse an awareness payload.
    pub fn awareness_record(&self) -> Result<AwarenessRecord, ProtocolError> {
        self.decode_payload(&[MessageType::Awareness])
    }
}
