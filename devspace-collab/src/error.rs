//! Error types for the collaboration core.
//!
//! Every concern gets its own enum so callers can tell a dropped frame
//! apart from a replica that has to be rebuilt.

use std::time::Duration;

use thiserror::Error;

use crate::replica::OpId;

/// Wire encoding failures.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("payload decompression failed: {0}")]
    Decompression(String),
    #[error("expected a {expected} message, got {got}")]
    InvalidMessageType {
        expected: &'static str,
        got: &'static str,
    },
}

/// Replica integration failures.
///
/// All variants are fatal: the replica can no longer converge with its
/// peers and must be rehydrated from a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("operation {op:?} references {dependency:?}, which is applied but is not an insert")]
    UnresolvableDependency { op: OpId, dependency: OpId },
    #[error("{count} operations waited longer than {window:?} for their dependencies")]
    CausalGapTimeout { count: usize, window: Duration },
    #[error("causal gap buffer overflow ({count} pending operations)")]
    BufferOverflow { count: usize },
}

/// Connection-level failures. All are transient and retried with backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors returned by the session handle API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session for document {0} is closed")]
    Closed(String),
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
