//! Document-order list of inserted characters, tombstones included.
//!
//! Items are stored in chunks of bounded length. Each chunk tracks how many
//! of its items are visible, so offset lookups step over whole chunks, and
//! an id index maps every item to the chunk holding it.

use rustc_hash::FxHashMap;

use super::op::OpId;

/// Chunks are split in half once they grow past this.
const MAX_CHUNK_LEN: usize = 128;

#[derive(Debug, Clone)]
pub(super) struct Item {
    pub id: OpId,
    pub origin: Option<OpId>,
    pub right: Option<OpId>,
    pub ch: char,
    pub deleted: bool,
}

#[derive(Debug, Default)]
struct Chunk {
    items: Vec<Item>,
    visible: usize,
}

/// Location of an item: chunk rank in document order, then index in the chunk.
///
/// Valid until the next insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Cursor {
    rank: usize,
    index: usize,
}

#[derive(Debug, Default)]
pub(super) struct Sequence {
    /// Chunk storage; a chunk's key is its index here and never changes.
    chunks: Vec<Chunk>,
    /// Chunk keys in document order.
    order: Vec<usize>,
    /// Rank of each chunk key in `order`.
    rank: Vec<usize>,
    index: FxHashMap<OpId, usize>,
    visible: usize,
}

impl Sequence {
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn visible_len(&self) -> usize {
        self.visible
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.index.contains_key(id)
    }

    pub fn find(&self, id: &OpId) -> Option<Cursor> {
        let key = *self.index.get(id)?;
        // Fresh inserts usually land at the tail of their chunk.
        let index = self.chunks[key].items.iter().rposition(|item| item.id == *id)?;
        Some(Cursor {
            rank: self.rank[key],
            index,
        })
    }

    pub fn get(&self, cursor: Cursor) -> &Item {
        &self.chunks[self.order[cursor.rank]].items[cursor.index]
    }

    /// The item after `cursor`, or the first item for `None`.
    pub fn next(&self, cursor: Option<Cursor>) -> Option<Cursor> {
        let (mut rank, mut index) = match cursor {
            Some(cursor) => (cursor.rank, cursor.index + 1),
            None => (0, 0),
        };
        while let Some(&key) = self.order.get(rank) {
            if index < self.chunks[key].items.len() {
                return Some(Cursor { rank, index });
            }
            rank += 1;
            index = 0;
        }
        None
    }

    /// Place `item` right after `left` (`None` = document start).
    pub fn insert_after(&mut self, left: Option<Cursor>, item: Item) {
        if self.order.is_empty() {
            self.chunks.push(Chunk::default());
            self.order.push(0);
            self.rank.push(0);
        }
        let (rank, index) = match left {
            Some(cursor) => (cursor.rank, cursor.index + 1),
            None => (0, 0),
        };
        let key = self.order[rank];
        self.index.insert(item.id, key);
        let chunk = &mut self.chunks[key];
        if !item.deleted {
            chunk.visible += 1;
            self.visible += 1;
        }
        chunk.items.insert(index, item);
        if chunk.items.len() > MAX_CHUNK_LEN {
            self.split(rank);
        }
    }

    fn split(&mut self, rank: usize) {
        let key = self.order[rank];
        let chunk = &mut self.chunks[key];
        let tail = chunk.items.split_off(chunk.items.len() / 2);
        let moved = tail.iter().filter(|item| !item.deleted).count();
        chunk.visible -= moved;

        let new_key = self.chunks.len();
        for item in &tail {
            self.index.insert(item.id, new_key);
        }
        self.chunks.push(Chunk {
            items: tail,
            visible: moved,
        });
        self.rank.push(0);
        self.order.insert(rank + 1, new_key);
        for (position, &key) in self.order.iter().enumerate().skip(rank + 1) {
            self.rank[key] = position;
        }
    }

    /// Tombstone the item `id`. Returns whether it was visible.
    pub fn delete(&mut self, id: &OpId) -> bool {
        let Some(&key) = self.index.get(id) else {
            return false;
        };
        let chunk = &mut self.chunks[key];
        match chunk.items.iter_mut().find(|item| item.id == *id) {
            Some(item) if !item.deleted => {
                item.deleted = true;
                chunk.visible -= 1;
                self.visible -= 1;
                true
            }
            _ => false,
        }
    }

    /// Cursor of the `offset`-th visible item.
    pub fn visible_at(&self, offset: usize) -> Option<Cursor> {
        let mut remaining = offset;
        for (rank, &key) in self.order.iter().enumerate() {
            let chunk = &self.chunks[key];
            if remaining < chunk.visible {
                let index = chunk
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| !item.deleted)
                    .nth(remaining)
                    .map(|(index, _)| index)?;
                return Some(Cursor { rank, index });
            }
            remaining -= chunk.visible;
        }
        None
    }

    /// Number of visible items before `cursor`.
    pub fn offset_of(&self, cursor: Cursor) -> usize {
        let before: usize = self.order[..cursor.rank]
            .iter()
            .map(|&key| self.chunks[key].visible)
            .sum();
        let within = self.chunks[self.order[cursor.rank]].items[..cursor.index]
            .iter()
            .filter(|item| !item.deleted)
            .count();
        before + within
    }

    pub fn last_visible(&self) -> Option<&Item> {
        self.order
            .iter()
            .rev()
            .map(|&key| &self.chunks[key])
            .find(|chunk| chunk.visible > 0)?
            .items
            .iter()
            .rev()
            .find(|item| !item.deleted)
    }

    /// Ids of up to `count` visible items starting at visible `offset`.
    pub fn visible_ids(&self, offset: usize, count: usize) -> Vec<OpId> {
        let mut ids = Vec::with_capacity(count);
        let mut cursor = self.visible_at(offset);
        while let Some(current) = cursor {
            if ids.len() == count {
                break;
            }
            let item = self.get(current);
            if !item.deleted {
                ids.push(item.id);
            }
            cursor = self.next(Some(current));
        }
        ids
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.order
            .iter()
            .flat_map(move |&key| self.chunks[key].items.iter())
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
    }
}
