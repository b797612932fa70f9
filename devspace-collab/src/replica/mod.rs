//! Replicated text document.
//!
//! A character-level replicated sequence: every inserted character is an
//! item that remembers both neighbours it was typed between, its *origin*
//! on the left and its *right origin*, tombstones included. Deletes only
//! set a tombstone. Concurrent inserts between the same neighbours are
//! ordered by ascending operation id, and a run typed by one replica is
//! never interleaved with a concurrent run, so every replica folds the same
//! operation set into the same text regardless of arrival order.
//!
//! ```text
//!  origin ──► [sibling, lowest id first] ... [sibling, highest id] ──► right
//! ```
//!
//! Operations whose dependencies have not arrived yet are parked in a
//! bounded buffer, indexed by the operation each one waits for, and
//! integrated as soon as that operation lands.

mod op;
mod sequence;

pub use op::{OpId, OpKind, Operation, ReplicaId, RelativePosition, StateVector};

use std::cell::OnceCell;
use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::config::CollabConfig;
use crate::error::ReplicaError;

use sequence::{Cursor, Item, Sequence};

/// Stable identifier of the file being edited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone)]
struct PendingOp {
    op: Operation,
    buffered_at: Instant,
}

enum Readiness {
    Ready,
    /// Waiting for the operation with this id.
    Blocked(OpId),
    Duplicate,
    Malformed(&'static str),
    Unresolvable(OpId),
}

/// Result of integrating a batch of remote operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Operations integrated (including previously buffered ones released by this batch).
    pub applied: usize,
    /// Duplicates, malformed operations and operations that can never apply.
    pub dropped: usize,
    /// Operations still waiting for a dependency after this batch.
    pub pending: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// One document replica: operation log, state vector and materialized text.
pub struct ReplicaStore {
    document_id: DocumentId,
    replica_id: ReplicaId,
    /// Last sequence number used for a local operation.
    local_seq: u64,
    items: Sequence,
    log: Vec<Operation>,
    state_vector: StateVector,
    /// Buffered operations keyed by the id each one waits for.
    pending: FxHashMap<OpId, Vec<PendingOp>>,
    pending_ids: FxHashSet<OpId>,
    /// Materialized on first read after a change.
    text: OnceCell<String>,
    causal_gap_timeout: Duration,
    max_pending: usize,
}

impl ReplicaStore {
    /// Empty replica with default buffering limits.
    pub fn new(document_id: DocumentId, replica_id: ReplicaId) -> Self {
        Self::with_config(document_id, replica_id, &CollabConfig::default())
    }

    pub fn with_config(document_id: DocumentId, replica_id: ReplicaId, config: &CollabConfig) -> Self {
        Self {
            document_id,
            replica_id,
            local_seq: 0,
            items: Sequence::default(),
            log: Vec::new(),
            state_vector: StateVector::new(),
            pending: FxHashMap::default(),
            pending_ids: FxHashSet::default(),
            text: OnceCell::new(),
            causal_gap_timeout: config.causal_gap_timeout(),
            max_pending: config.max_pending_operations,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Current materialized text.
    pub fn text(&self) -> &str {
        self.text.get_or_init(|| self.items.chars().collect())
    }

    /// Visible length in characters.
    pub fn len(&self) -> usize {
        self.items.visible_len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.visible_len() == 0
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn pending_len(&self) -> usize {
        self.pending_ids.len()
    }

    pub fn operation_count(&self) -> usize {
        self.log.len()
    }

    /// Seed an untouched replica with `content` as synthetic origin inserts.
    ///
    /// Does nothing once the replica holds any insert, even a tombstoned
    /// one. Returns the seed operations so they can be broadcast.
    pub fn seed(&mut self, content: &str) -> Vec<Operation> {
        if !self.items.is_empty() || content.is_empty() {
            return Vec::new();
        }
        let seed = ReplicaId::seed(content);
        let mut origin = None;
        let ops: Vec<Operation> = content
            .chars()
            .enumerate()
            .map(|(i, ch)| {
                let id = OpId::new(seed, i as u64 + 1);
                let op = Operation::insert(id, ch, origin, None);
                origin = Some(id);
                op
            })
            .collect();
        for op in &ops {
            self.integrate(*op);
        }
        log::debug!(
            "Seeded document {} with {} characters",
            self.document_id,
            ops.len()
        );
        ops
    }

    /// Insert `text` at character `position` (clamped to the document end).
    pub fn apply_local_insert(&mut self, position: usize, text: &str) -> Vec<Operation> {
        if text.is_empty() {
            return Vec::new();
        }
        let position = position.min(self.items.visible_len());
        let left = match position {
            0 => None,
            _ => self.items.visible_at(position - 1),
        };
        let mut origin = left.map(|cursor| self.items.get(cursor).id);
        let right = self.items.next(left).map(|cursor| self.items.get(cursor).id);

        let mut ops = Vec::with_capacity(text.chars().count());
        for ch in text.chars() {
            let op = Operation::insert(self.next_local_id(), ch, origin, right);
            self.integrate(op);
            origin = Some(op.id);
            ops.push(op);
        }
        ops
    }

    /// Tombstone every visible character in `range` (clamped).
    pub fn apply_local_delete(&mut self, range: Range<usize>) -> Vec<Operation> {
        let end = range.end.min(self.items.visible_len());
        if range.start >= end {
            return Vec::new();
        }
        let targets = self.items.visible_ids(range.start, end - range.start);

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let op = Operation::delete(self.next_local_id(), target);
            self.integrate(op);
            ops.push(op);
        }
        ops
    }

    /// Integrate foreign operations.
    ///
    /// Already-applied and malformed operations are dropped; operations whose
    /// dependency is unknown are buffered until it arrives. Fails when the
    /// replica can no longer converge. Operations that can never apply are
    /// left out and the rest of the batch is still integrated, so the
    /// replica stays consistent after an error.
    pub fn merge_remote(
        &mut self,
        operations: impl IntoIterator<Item = Operation>,
        now: Instant,
    ) -> Result<MergeOutcome, ReplicaError> {
        let mut outcome = MergeOutcome::default();
        let mut failure = None;
        for op in operations {
            match self.readiness(&op) {
                Readiness::Ready => {
                    let released = self.apply_and_release(op, &mut outcome);
                    failure = failure.or(released.err());
                }
                Readiness::Blocked(waiting_on) => {
                    if !self.pending_ids.insert(op.id) {
                        outcome.dropped += 1;
                        continue;
                    }
                    log::trace!("Buffering {:?} waiting on {:?}", op.id, waiting_on);
                    self.pending
                        .entry(waiting_on)
                        .or_default()
                        .push(PendingOp { op, buffered_at: now });
                    if self.pending_ids.len() > self.max_pending {
                        failure = failure.or(Some(ReplicaError::BufferOverflow {
                            count: self.pending_ids.len(),
                        }));
                    }
                }
                Readiness::Duplicate => {
                    log::trace!("Dropping already applied {:?}", op.id);
                    outcome.dropped += 1;
                }
                Readiness::Malformed(reason) => {
                    log::warn!("Dropping malformed operation {:?}: {reason}", op.id);
                    outcome.dropped += 1;
                }
                Readiness::Unresolvable(dependency) => {
                    outcome.dropped += 1;
                    failure = failure.or(Some(ReplicaError::UnresolvableDependency {
                        op: op.id,
                        dependency,
                    }));
                }
            }
        }
        outcome.pending = self.pending_ids.len();
        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Integrate `op`, then every buffered operation it unblocks.
    fn apply_and_release(&mut self, op: Operation, outcome: &mut MergeOutcome) -> Result<(), ReplicaError> {
        let mut failure = None;
        let mut ready = vec![op];
        while let Some(op) = ready.pop() {
            self.integrate(op);
            outcome.applied += 1;
            let Some(waiters) = self.pending.remove(&op.id) else {
                continue;
            };
            for waiter in waiters {
                match self.readiness(&waiter.op) {
                    Readiness::Ready => {
                        self.pending_ids.remove(&waiter.op.id);
                        ready.push(waiter.op);
                    }
                    Readiness::Blocked(next) => self.pending.entry(next).or_default().push(waiter),
                    Readiness::Duplicate | Readiness::Malformed(_) => {
                        self.pending_ids.remove(&waiter.op.id);
                    }
                    Readiness::Unresolvable(dependency) => {
                        self.pending_ids.remove(&waiter.op.id);
                        outcome.dropped += 1;
                        failure = failure.or(Some(ReplicaError::UnresolvableDependency {
                            op: waiter.op.id,
                            dependency,
                        }));
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fail if any buffered operation has outlived the causal-gap window.
    pub fn expire_pending(&self, now: Instant) -> Result<(), ReplicaError> {
        let window = self.causal_gap_timeout;
        let count = self
            .pending
            .values()
            .flatten()
            .filter(|p| now.saturating_duration_since(p.buffered_at) > window)
            .count();
        if count > 0 {
            return Err(ReplicaError::CausalGapTimeout { count, window });
        }
        Ok(())
    }

    /// Drop every buffered operation. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let count = self.pending_ids.len();
        self.pending.clear();
        self.pending_ids.clear();
        count
    }

    /// Every applied operation not covered by `remote`, in causal order.
    pub fn diff_since(&self, remote: &StateVector) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|op| !remote.covers(&op.id))
            .copied()
            .collect()
    }

    /// Anchor a character offset to the surrounding characters.
    pub fn relative_position(&self, offset: usize) -> RelativePosition {
        if let Some(cursor) = self.items.visible_at(offset) {
            return RelativePosition::Before(self.items.get(cursor).id);
        }
        match self.items.last_visible() {
            Some(last) => RelativePosition::After(last.id),
            None => RelativePosition::Start,
        }
    }

    /// Current character offset of an anchored position.
    ///
    /// `None` when the anchor has not been merged into this replica yet.
    pub fn resolve(&self, position: &RelativePosition) -> Option<usize> {
        let (id, after) = match position {
            RelativePosition::Start => return Some(0),
            RelativePosition::Before(id) => (id, false),
            RelativePosition::After(id) => (id, true),
        };
        let cursor = self.items.find(id)?;
        let before = self.items.offset_of(cursor);
        if after && !self.items.get(cursor).deleted {
            Some(before + 1)
        } else {
            Some(before)
        }
    }

    fn next_local_id(&mut self) -> OpId {
        self.local_seq += 1;
        OpId::new(self.replica_id, self.local_seq)
    }

    fn readiness(&self, op: &Operation) -> Readiness {
        if op.id.seq == 0 {
            return Readiness::Malformed("sequence numbers start at 1");
        }
        if self.state_vector.covers(&op.id) {
            return Readiness::Duplicate;
        }
        if op.id.replica == self.replica_id {
            return Readiness::Malformed("foreign operation carries the local replica id");
        }
        if let OpKind::Insert {
            origin: Some(origin),
            right: Some(right),
            ..
        } = op.kind
        {
            if origin == right {
                return Readiness::Malformed("origin and right origin coincide");
            }
        }
        if op
            .dependencies()
            .any(|dep| dep.replica == op.id.replica && dep.seq >= op.id.seq)
        {
            return Readiness::Malformed("depends on a later operation of its own replica");
        }
        let expected = self.state_vector.get(&op.id.replica) + 1;
        if op.id.seq != expected {
            return Readiness::Blocked(OpId::new(op.id.replica, op.id.seq - 1));
        }
        for dep in op.dependencies() {
            if self.items.contains(&dep) {
                continue;
            }
            if self.state_vector.covers(&dep) {
                return Readiness::Unresolvable(dep);
            }
            return Readiness::Blocked(dep);
        }
        Readiness::Ready
    }

    /// Place an applicable operation. Callers guarantee its dependencies are present.
    fn integrate(&mut self, op: Operation) {
        match op.kind {
            OpKind::Insert { ch, origin, right } => {
                let left = self.place(op.id, origin, right);
                self.items.insert_after(
                    left,
                    Item {
                        id: op.id,
                        origin,
                        right,
                        ch,
                        deleted: false,
                    },
                );
            }
            OpKind::Delete { target } => {
                self.items.delete(&target);
            }
        }
        self.text.take();
        self.state_vector.advance(op.id);
        self.log.push(op);
    }

    /// The item a new insert goes right after.
    ///
    /// Scans the items between `origin` and `right`: concurrent siblings
    /// with the same origin and a lower id stay in front, and so does
    /// everything inserted inside such a sibling's run.
    fn place(&self, id: OpId, origin: Option<OpId>, right: Option<OpId>) -> Option<Cursor> {
        let mut left = origin.and_then(|origin| self.items.find(&origin));
        let mut scan = self.items.next(left);
        let mut before_origin = FxHashSet::default();
        let mut conflicting = FxHashSet::default();

        while let Some(cursor) = scan {
            let other = self.items.get(cursor);
            if Some(other.id) == right {
                break;
            }
            before_origin.insert(other.id);
            conflicting.insert(other.id);
            if other.origin == origin {
                if other.id < id {
                    left = Some(cursor);
                    conflicting.clear();
                } else if other.right == right {
                    break;
                }
            } else if other.origin.is_some_and(|o| before_origin.contains(&o)) {
                if !other.origin.is_some_and(|o| conflicting.contains(&o)) {
                    left = Some(cursor);
                    conflicting.clear();
                }
            } else {
                break;
            }
            scan = self.items.next(Some(cursor));
        }
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc() -> DocumentId {
        DocumentId::new("file-1")
    }

    fn replica(n: u128) -> ReplicaStore {
        ReplicaStore::new(doc(), ReplicaId::from_uuid(Uuid::from_u128(n)))
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_local_insert_and_delete() {
        let mut r = replica(1);
        let ops = r.apply_local_insert(0, "hello");
        assert_eq!(ops.len(), 5);
        assert_eq!(r.text(), "hello");

        r.apply_local_insert(5, " world");
        assert_eq!(r.text(), "hello world");

        let ops = r.apply_local_delete(0..6);
        assert_eq!(ops.len(), 6);
        assert_eq!(r.text(), "world");
        assert_eq!(r.len(), 5);
        assert_eq!(r.state_vector().get(&r.replica_id()), 17);
    }

    #[test]
    fn test_local_positions_are_clamped() {
        let mut r = replica(1);
        r.apply_local_insert(42, "ab");
        assert_eq!(r.text(), "ab");
        assert_eq!(r.apply_local_delete(1..99).len(), 1);
        assert_eq!(r.text(), "a");
        assert!(r.apply_local_delete(5..9).is_empty());
    }

    #[test]
    fn test_repeated_insert_at_same_spot_keeps_intent() {
        let mut r = replica(1);
        r.apply_local_insert(0, "XY");
        r.apply_local_insert(1, "a");
        r.apply_local_insert(1, "b");
        assert_eq!(r.text(), "XbaY");
    }

    #[test]
    fn test_insert_after_tombstone() {
        let mut r = replica(1);
        r.apply_local_insert(0, "abc");
        r.apply_local_delete(1..2);
        r.apply_local_insert(1, "Z");
        assert_eq!(r.text(), "aZc");
    }

    #[test]
    fn test_unicode_positions_count_characters() {
        let mut r = replica(1);
        r.apply_local_insert(0, "héllo✓");
        r.apply_local_insert(2, "—");
        assert_eq!(r.text(), "hé—llo✓");
        assert_eq!(r.len(), 7);
    }

    #[test]
    fn test_convergence_any_order() {
        let mut a = replica(1);
        let mut b = replica(2);
        let mut c = replica(3);
        let op_a = a.apply_local_insert(0, "A");
        let op_b = b.apply_local_insert(0, "B");
        let op_c = c.apply_local_insert(0, "C");

        let mut r1 = replica(10);
        let mut r2 = replica(11);
        for ops in [&op_a, &op_b, &op_c] {
            r1.merge_remote(ops.iter().copied(), now()).unwrap();
        }
        for ops in [&op_c, &op_a, &op_b] {
            r2.merge_remote(ops.iter().copied(), now()).unwrap();
        }
        assert_eq!(r1.text(), r2.text());
        assert_eq!(r1.text().len(), 3);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ops = a.apply_local_insert(0, "abc");

        let first = b.merge_remote(ops.clone(), now()).unwrap();
        assert_eq!(first.applied, 3);
        let text = b.text().to_string();
        let sv = b.state_vector().clone();

        let second = b.merge_remote(ops, now()).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.dropped, 3);
        assert_eq!(b.text(), text);
        assert_eq!(b.state_vector(), &sv);
        assert_eq!(b.operation_count(), 3);
    }

    #[test]
    fn test_causal_buffering() {
        let mut a = replica(1);
        let mut b = replica(2);
        let op1 = a.apply_local_insert(0, "x");
        let op2 = a.apply_local_insert(1, "y");

        let outcome = b.merge_remote(op2.clone(), now()).unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.pending, 1);
        assert_eq!(b.text(), "");

        let outcome = b.merge_remote(op1, now()).unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.pending, 0);
        assert_eq!(b.text(), "xy");
    }

    #[test]
    fn test_buffered_delete_waits_for_target() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ins = a.apply_local_insert(0, "q");
        let del = a.apply_local_delete(0..1);

        b.merge_remote(del, now()).unwrap();
        assert_eq!(b.pending_len(), 1);
        b.merge_remote(ins, now()).unwrap();
        assert_eq!(b.pending_len(), 0);
        assert_eq!(b.text(), "");
        assert_eq!(b.state_vector().get(&a.replica_id()), 2);
    }

    #[test]
    fn test_concurrent_tie_break_is_deterministic() {
        let mut a = replica(1);
        let mut b = replica(2);
        let base = a.apply_local_insert(0, "[]");
        b.merge_remote(base, now()).unwrap();

        let x = a.apply_local_insert(1, "x");
        let y = b.apply_local_insert(1, "y");
        a.merge_remote(y, now()).unwrap();
        b.merge_remote(x, now()).unwrap();

        assert_eq!(a.text(), b.text());
        // Lower replica id sorts first.
        assert_eq!(a.text(), "[xy]");
    }

    #[test]
    fn test_concurrent_siblings_order_by_id_regardless_of_history() {
        let mut a = replica(2);
        let mut b = replica(1);
        let base = a.apply_local_insert(0, "[]");
        b.merge_remote(base, now()).unwrap();

        // `a` has typed more before its concurrent insert than `b` has.
        let mut from_a = a.apply_local_insert(2, "zzz");
        from_a.extend(a.apply_local_insert(1, "x"));
        let from_b = b.apply_local_insert(1, "y");

        a.merge_remote(from_b, now()).unwrap();
        b.merge_remote(from_a, now()).unwrap();
        assert_eq!(a.text(), "[yx]zzz");
        assert_eq!(b.text(), "[yx]zzz");
    }

    #[test]
    fn test_concurrent_runs_do_not_interleave() {
        let mut a = replica(1);
        let mut b = replica(2);
        let base = a.apply_local_insert(0, "[]");
        b.merge_remote(base, now()).unwrap();

        let abc = a.apply_local_insert(1, "abc");
        let xyz = b.apply_local_insert(1, "xyz");
        a.merge_remote(xyz, now()).unwrap();
        b.merge_remote(abc, now()).unwrap();
        assert_eq!(a.text(), "[abcxyz]");
        assert_eq!(b.text(), a.text());
    }

    #[test]
    fn test_large_document_merge_stays_fast() {
        let content = "fn main() { println!(\"hello\"); }\n".repeat(3_100);
        let chars = content.chars().count();
        assert!(chars >= 100_000);

        let started = Instant::now();
        let mut a = replica(1);
        let seed = a.seed(&content);
        let edits = a.apply_local_insert(chars / 2, "// midpoint\n");

        let mut b = replica(2);
        let outcome = b
            .merge_remote(seed.into_iter().chain(edits), now())
            .unwrap();
        assert_eq!(outcome.applied, chars + 12);

        // Reverse order: everything but the first operation buffers, then drains.
        let roomy = CollabConfig {
            max_pending_operations: chars * 2,
            ..CollabConfig::default()
        };
        let mut c = ReplicaStore::with_config(doc(), ReplicaId::from_uuid(Uuid::from_u128(3)), &roomy);
        let mut ops = a.diff_since(&StateVector::new());
        ops.reverse();
        c.merge_remote(ops, now()).unwrap();

        assert_eq!(b.text(), a.text());
        assert_eq!(c.text(), a.text());
        assert_eq!(c.pending_len(), 0);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_diff_since_returns_missing_operations() {
        let mut a = replica(1);
        let mut b = replica(2);
        let first = a.apply_local_insert(0, "ab");
        b.merge_remote(first, now()).unwrap();
        a.apply_local_insert(2, "cd");

        let diff = a.diff_since(b.state_vector());
        assert_eq!(diff.len(), 2);
        b.merge_remote(diff, now()).unwrap();
        assert_eq!(b.text(), "abcd");
        assert!(a.diff_since(b.state_vector()).is_empty());
        assert_eq!(a.diff_since(&StateVector::new()).len(), 4);
    }

    #[test]
    fn test_unresolvable_dependency_is_fatal() {
        let mut a = replica(1);
        let mut b = replica(2);
        let ins = a.apply_local_insert(0, "a");
        let del = a.apply_local_delete(0..1);
        b.merge_remote(ins.iter().copied().chain(del.iter().copied()), now())
            .unwrap();

        // An insert whose origin is the delete operation can never be placed.
        let bogus = Operation::insert(OpId::new(a.replica_id(), 3), 'z', Some(del[0].id), None);
        let err = b.merge_remote([bogus], now()).unwrap_err();
        assert!(matches!(err, ReplicaError::UnresolvableDependency { .. }));
        assert_eq!(b.state_vector().get(&a.replica_id()), 2);
    }

    #[test]
    fn test_causal_gap_timeout() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.apply_local_insert(0, "a");
        let orphan = a.apply_local_insert(1, "b");

        let start = now();
        b.merge_remote(orphan, start).unwrap();
        assert!(b.expire_pending(start).is_ok());
        let late = start + CollabConfig::default().causal_gap_timeout() + Duration::from_millis(1);
        assert!(matches!(
            b.expire_pending(late),
            Err(ReplicaError::CausalGapTimeout { count: 1, .. })
        ));
    }

    #[test]
    fn test_buffer_overflow() {
        let config = CollabConfig {
            max_pending_operations: 2,
            ..CollabConfig::default()
        };
        let mut a = replica(1);
        let mut b = ReplicaStore::with_config(doc(), ReplicaId::random(), &config);
        a.apply_local_insert(0, "a");
        let orphans = a.apply_local_insert(1, "bcd");
        assert!(matches!(
            b.merge_remote(orphans, now()),
            Err(ReplicaError::BufferOverflow { count: 3 })
        ));
    }

    #[test]
    fn test_malformed_operations_are_dropped() {
        let mut b = replica(2);
        let r = ReplicaId::from_uuid(Uuid::from_u128(7));
        let zero = Operation::insert(OpId::new(r, 0), 'a', None, None);
        let self_ref = Operation::insert(OpId::new(r, 1), 'a', Some(OpId::new(r, 1)), None);
        let other = ReplicaId::random();
        let pinched = Operation::insert(
            OpId::new(r, 1),
            'a',
            Some(OpId::new(other, 1)),
            Some(OpId::new(other, 1)),
        );
        let outcome = b.merge_remote([zero, self_ref, pinched], now()).unwrap();
        assert_eq!(outcome.dropped, 3);
        assert_eq!(outcome.pending, 0);
        assert!(b.is_empty());
    }

    #[test]
    fn test_seed_is_idempotent_across_replicas() {
        let mut a = replica(1);
        let mut b = replica(2);
        let seed_a = a.seed("fn main() {}\n");
        let seed_b = b.seed("fn main() {}\n");
        assert_eq!(seed_a, seed_b);

        let outcome = a.merge_remote(seed_b, now()).unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(a.text(), "fn main() {}\n");
    }

    #[test]
    fn test_seed_skipped_when_history_exists() {
        let mut a = replica(1);
        a.apply_local_insert(0, "x");
        a.apply_local_delete(0..1);
        assert!(a.seed("content").is_empty());
        assert_eq!(a.text(), "");
    }

    #[test]
    fn test_relative_position_survives_remote_insert() {
        let mut a = replica(1);
        let mut b = replica(2);
        let base = a.apply_local_insert(0, "0123456789abcdef");
        b.merge_remote(base, now()).unwrap();

        let anchor = b.relative_position(10);
        let prefix = a.apply_local_insert(0, "HELLO");
        b.merge_remote(prefix, now()).unwrap();
        assert_eq!(b.resolve(&anchor), Some(15));
    }

    #[test]
    fn test_relative_position_at_end_and_deleted_anchor() {
        let mut r = replica(1);
        assert_eq!(r.relative_position(0), RelativePosition::Start);
        r.apply_local_insert(0, "abc");

        let end = r.relative_position(3);
        assert!(matches!(end, RelativePosition::After(_)));
        assert_eq!(r.resolve(&end), Some(3));

        let at_b = r.relative_position(1);
        r.apply_local_delete(1..2);
        assert_eq!(r.resolve(&at_b), Some(1));

        let unknown = RelativePosition::Before(OpId::new(ReplicaId::random(), 1));
        assert_eq!(r.resolve(&unknown), None);
    }
}
