//! Remote cursor projection.
//!
//! Turns the replica-stable selections carried in awareness records into
//! offsets and line/column ranges of the current text, and reports only
//! what changed since the previous projection so the editor can patch its
//! decorations instead of redrawing them all.

use std::collections::BTreeMap;

use crate::awareness::{AwarenessRecord, CursorColor};
use crate::replica::{ReplicaId, ReplicaStore};

/// 1-based line and column, counted in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineColumn {
    pub line: usize,
    pub column: usize,
}

/// One remote collaborator's selection, ready to render.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorDecoration {
    pub client_id: ReplicaId,
    pub color: CursorColor,
    /// Character offset where the highlighted range starts.
    pub range_start: usize,
    /// Character offset where the highlighted range ends (exclusive).
    pub range_end: usize,
    /// Caret offset (the selection head).
    pub head: usize,
    pub start: LineColumn,
    pub end: LineColumn,
    pub label: String,
}

impl CursorDecoration {
    pub fn is_caret(&self) -> bool {
        self.range_start == self.range_end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecorationChange {
    Added(CursorDecoration),
    Updated(CursorDecoration),
    Removed(ReplicaId),
}

/// Character offsets of every line start.
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            text.chars()
                .enumerate()
                .filter(|(_, ch)| *ch == '\n')
                .map(|(offset, _)| offset + 1),
        );
        Self { starts }
    }

    fn locate(&self, offset: usize) -> LineColumn {
        let line = match self.starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        LineColumn {
            line: line + 1,
            column: offset - self.starts[line] + 1,
        }
    }
}

/// Keeps the last projection so each call yields a delta.
pub struct CursorProjector {
    local: ReplicaId,
    current: BTreeMap<ReplicaId, CursorDecoration>,
}

impl CursorProjector {
    pub fn new(local: ReplicaId) -> Self {
        Self {
            local,
            current: BTreeMap::new(),
        }
    }

    /// Recompute decorations against the replica's current text.
    pub fn project(
        &mut self,
        replica: &ReplicaStore,
        records: &[AwarenessRecord],
    ) -> Vec<DecorationChange> {
        let lines = LineIndex::new(replica.text());
        let mut next = BTreeMap::new();

        for record in records.iter().filter(|r| r.client_id != self.local) {
            let Some(selection) = &record.selection else {
                continue;
            };
            // Anchors not merged yet: hide the cursor until they arrive.
            let (Some(anchor), Some(head)) =
                (replica.resolve(&selection.anchor), replica.resolve(&selection.head))
            else {
                continue;
            };
            let (range_start, range_end) = (anchor.min(head), anchor.max(head));
            next.insert(
                record.client_id,
                CursorDecoration {
                    client_id: record.client_id,
                    color: record.color,
                    range_start,
                    range_end,
                    head,
                    start: lines.locate(range_start),
                    end: lines.locate(range_end),
                    label: record.display_name.clone(),
                },
            );
        }

        let mut changes = Vec::new();
        for (id, _) in self.current.iter().filter(|(id, _)| !next.contains_key(*id)) {
            changes.push(DecorationChange::Removed(*id));
        }
        for (id, decoration) in &next {
            match self.current.get(id) {
                None => changes.push(DecorationChange::Added(decoration.clone())),
                Some(previous) if previous != decoration => {
                    changes.push(DecorationChange::Updated(decoration.clone()))
                }
                Some(_) => {}
            }
        }
        self.current = next;
        changes
    }

    /// Drop every decoration (e.g. when the replica is rebuilt).
    pub fn clear(&mut self) -> Vec<DecorationChange> {
        std::mem::take(&mut self.current)
            .into_keys()
            .map(DecorationChange::Removed)
            .collect()
    }

    pub fn decorations(&self) -> impl Iterator<Item = &CursorDecoration> {
        self.current.values()
    }

    pub fn get(&self, client_id: &ReplicaId) -> Option<&CursorDecoration> {
        self.current.get(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::Selection;
    use crate::replica::DocumentId;
    use std::time::Instant;

    fn store(text: &str) -> ReplicaStore {
        let mut store = ReplicaStore::new(DocumentId::new("doc"), ReplicaId::random());
        store.apply_local_insert(0, text);
        store
    }

    fn record_at(store: &ReplicaStore, anchor: usize, head: usize) -> AwarenessRecord {
        let mut record = AwarenessRecord::new(ReplicaId::random(), "Bob");
        record.selection = Some(Selection {
            anchor: store.relative_position(anchor),
            head: store.relative_position(head),
        });
        record
    }

    #[test]
    fn test_line_index() {
        let lines = LineIndex::new("ab\ncd\n\nx");
        assert_eq!(lines.locate(0), LineColumn { line: 1, column: 1 });
        assert_eq!(lines.locate(2), LineColumn { line: 1, column: 3 });
        assert_eq!(lines.locate(3), LineColumn { line: 2, column: 1 });
        assert_eq!(lines.locate(6), LineColumn { line: 3, column: 1 });
        assert_eq!(lines.locate(8), LineColumn { line: 4, column: 2 });
    }

    #[test]
    fn test_projects_selection_range() {
        let store = store("let x = 1;\nlet y = 2;\n");
        let record = record_at(&store, 15, 12);
        let mut projector = CursorProjector::new(store.replica_id());

        let changes = projector.project(&store, &[record.clone()]);
        assert_eq!(changes.len(), 1);
        let DecorationChange::Added(decoration) = &changes[0] else {
            panic!("expected Added, got {changes:?}");
        };
        assert_eq!((decoration.range_start, decoration.range_end), (12, 15));
        assert_eq!(decoration.head, 12);
        assert_eq!(decoration.start, LineColumn { line: 2, column: 2 });
        assert_eq!(decoration.end, LineColumn { line: 2, column: 5 });
        assert_eq!(decoration.label, "Bob");
        assert!(!decoration.is_caret());
    }

    #[test]
    fn test_cursor_remap_on_remote_edit() {
        let mut ours = store("0123456789abcdefghij");
        let mut theirs =
            ReplicaStore::new(DocumentId::new("doc"), ReplicaId::random());
        theirs
            .merge_remote(ours.diff_since(theirs.state_vector()), Instant::now())
            .unwrap();

        let record = record_at(&ours, 10, 10);
        let mut projector = CursorProjector::new(ours.replica_id());
        projector.project(&ours, &[record.clone()]);
        assert_eq!(projector.get(&record.client_id).unwrap().head, 10);

        let prefix = theirs.apply_local_insert(0, "ABCDE");
        ours.merge_remote(prefix, Instant::now()).unwrap();

        let changes = projector.project(&ours, &[record.clone()]);
        assert!(matches!(&changes[..], [DecorationChange::Updated(d)] if d.head == 15));
        assert!(projector.get(&record.client_id).unwrap().is_caret());
    }

    #[test]
    fn test_unchanged_projection_emits_nothing() {
        let store = store("hello");
        let record = record_at(&store, 1, 3);
        let mut projector = CursorProjector::new(store.replica_id());
        assert_eq!(projector.project(&store, &[record.clone()]).len(), 1);
        assert!(projector.project(&store, &[record]).is_empty());
    }

    #[test]
    fn test_removed_when_record_or_selection_disappears() {
        let store = store("hello");
        let mut record = record_at(&store, 1, 1);
        let mut projector = CursorProjector::new(store.replica_id());
        projector.project(&store, &[record.clone()]);

        record.selection = None;
        let changes = projector.project(&store, &[record.clone()]);
        assert_eq!(changes, vec![DecorationChange::Removed(record.client_id)]);
        assert_eq!(projector.decorations().count(), 0);
    }

    #[test]
    fn test_self_excluded() {
        let store = store("hello");
        let mut record = record_at(&store, 0, 2);
        record.client_id = store.replica_id();
        let mut projector = CursorProjector::new(store.replica_id());
        assert!(projector.project(&store, &[record]).is_empty());
    }

    #[test]
    fn test_clear() {
        let store = store("hello");
        let record = record_at(&store, 0, 0);
        let mut projector = CursorProjector::new(store.replica_id());
        projector.project(&store, &[record.clone()]);
        assert_eq!(projector.clear(), vec![DecorationChange::Removed(record.client_id)]);
    }
}
