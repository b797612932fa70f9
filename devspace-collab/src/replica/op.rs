//! Identifiers, operations and version summaries exchanged between replicas.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for name-based seed replica ids.
const SEED_NAMESPACE: Uuid = Uuid::from_u128(0x6c0d_e5ba_ce5e_4d0b_9a1f_2f3e_7c41_a9d2);

/// Identity of one replica (one connected client instance, the relay, or the
/// synthetic seed author of a document's initial content).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Fresh random identity, generated once per session.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Deterministic identity for the seed operations of `content`.
    ///
    /// Two clients seeding the same content produce the same operations.
    pub fn seed(content: &str) -> Self {
        Self(Uuid::new_v5(&SEED_NAMESPACE, content.as_bytes()))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex digits, for logs and placeholder names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({})", self.short())
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique operation id. Ordered by replica, then sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    /// Per-replica sequence number, contiguous from 1.
    pub seq: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, seq: u64) -> Self {
        Self { replica, seq }
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.replica.short(), self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Place `ch` between `origin` and `right`, its neighbours at creation
    /// time (`None` = document start / end).
    Insert {
        ch: char,
        origin: Option<OpId>,
        /// Item that followed `origin` when this character was typed,
        /// tombstones included.
        right: Option<OpId>,
    },
    /// Tombstone the character inserted by `target`.
    Delete { target: OpId },
}

/// A single character-level edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OpKind,
}

impl Operation {
    pub fn insert(id: OpId, ch: char, origin: Option<OpId>, right: Option<OpId>) -> Self {
        Self {
            id,
            kind: OpKind::Insert { ch, origin, right },
        }
    }

    pub fn delete(id: OpId, target: OpId) -> Self {
        Self {
            id,
            kind: OpKind::Delete { target },
        }
    }

    /// Inserts this operation cannot be applied without.
    pub fn dependencies(&self) -> impl Iterator<Item = OpId> {
        let (first, second) = match self.kind {
            OpKind::Insert { origin, right, .. } => (origin, right),
            OpKind::Delete { target } => (Some(target), None),
        };
        first.into_iter().chain(second)
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }
}

/// Highest contiguous sequence applied per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest applied sequence for `replica` (0 = nothing seen).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Whether the operation `id` is reflected in this vector.
    pub fn covers(&self, id: &OpId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// Record `id` as applied.
    pub fn advance(&mut self, id: OpId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        if id.seq > *entry {
            *entry = id.seq;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of operations summarized.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

/// A position that survives remote edits: anchored to a character's insert
/// id rather than to an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelativePosition {
    /// Immediately before the character inserted by this id.
    Before(OpId),
    /// Immediately after the character inserted by this id.
    After(OpId),
    /// Start of an empty document.
    Start,
}
