//! Download queue: an arena-allocated tree of directories/files with a user-visible
//! total order over top-level items (spec.md §4.G.1, §9 "Back-references without cycles").
//!
//! Nodes reference their parent by index rather than by pointer, so the whole tree is a
//! flat `Vec` with no ownership cycles; the arena outlives every `DownloadId` handed out.

use std::collections::HashMap;

use crate::chunk::ChunkHash;
use crate::identity::PeerId;

/// Stable handle into the arena. Indices are reused after `remove`, so a stale handle
/// from before a removal must never be dereferenced — callers hold these only transiently.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DownloadId(u32);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Position {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum DownloadStatus {
    Queued,
    Requesting,
    Transferring,
    Downloading,
    Paused,
    Complete,
    HashMismatch,
    IoError,
    NoSource,
    UnknownPeerSource,
}

impl DownloadStatus {
    pub fn is_error(self) -> bool {
        matches!(self, DownloadStatus::HashMismatch | DownloadStatus::IoError | DownloadStatus::NoSource | DownloadStatus::UnknownPeerSource)
    }
}

/// One chunk slot inside a file item (spec.md §4.G.6 per-chunk state machine).
#[derive(Debug, Clone)]
pub struct ChunkSlot {
    pub hash: ChunkHash,
    pub index: u32,
    pub size: u64,
    pub downloaded_bytes: u64,
    pub status: DownloadStatus,
    pub source: Option<PeerId>,
}

impl ChunkSlot {
    pub fn is_complete(&self) -> bool {
        self.status == DownloadStatus::Complete
    }
}

#[derive(Debug)]
pub enum DownloadKind {
    File {
        chunks: Vec<ChunkSlot>,
        file_key: u64,
    },
    Directory,
}

#[derive(Debug)]
pub struct DownloadNode {
    pub name: String,
    pub parent: Option<DownloadId>,
    pub children: Vec<DownloadId>,
    pub kind: DownloadKind,
    pub size: u64,
    pub downloaded_bytes: u64,
    pub status: DownloadStatus,
    pub paused: bool,
    pub peer_source_nick: Option<String>,
    /// Incremental rollup counters (spec.md §4.G.5), maintained by `rollup`.
    pub nb_error: u32,
    pub nb_paused: u32,
    pub nb_downloading: u32,
    /// The error status a descendant most recently entered, while `nb_error > 0`.
    /// Cleared once `nb_error` returns to zero. This, not the status of whichever
    /// unrelated sibling happens to be propagating right now, is what a directory's
    /// own error status is derived from.
    pub error_status: Option<DownloadStatus>,
}

impl DownloadNode {
    fn new_file(name: String, parent: Option<DownloadId>, file_key: u64, chunks: Vec<ChunkSlot>) -> Self {
        let size = chunks.iter().map(|c| c.size).sum();
        Self {
            name,
            parent,
            children: Vec::new(),
            kind: DownloadKind::File { chunks, file_key },
            size,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            paused: false,
            peer_source_nick: None,
            nb_error: 0,
            nb_paused: 0,
            nb_downloading: 0,
            error_status: None,
        }
    }

    fn new_dir(name: String, parent: Option<DownloadId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            kind: DownloadKind::Directory,
            size: 0,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            paused: false,
            peer_source_nick: None,
            nb_error: 0,
            nb_paused: 0,
            nb_downloading: 0,
            error_status: None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, DownloadKind::File { .. })
    }

    pub fn chunk_ref(&self, index: usize) -> Option<&ChunkSlot> {
        match &self.kind {
            DownloadKind::File { chunks, .. } => chunks.get(index),
            DownloadKind::Directory => None,
        }
    }

    pub fn file_key(&self) -> Option<u64> {
        match &self.kind {
            DownloadKind::File { file_key, .. } => Some(*file_key),
            DownloadKind::Directory => None,
        }
    }
}

/// Owns every node and the top-level total order (spec.md §4.G.1: "the entire queue is a
/// totally ordered list"). Only top-level items participate in the user-visible order;
/// directory contents are reached via `children` and are not independently reorderable.
pub struct DownloadQueue {
    nodes: Vec<Option<DownloadNode>>,
    free: Vec<u32>,
    order: Vec<DownloadId>,
    by_file_key: HashMap<u64, DownloadId>,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            by_file_key: HashMap::new(),
        }
    }

    fn alloc(&mut self, node: DownloadNode) -> DownloadId {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot as usize] = Some(node);
            DownloadId(slot)
        } else {
            self.nodes.push(Some(node));
            DownloadId((self.nodes.len() - 1) as u32)
        }
    }

    pub fn get(&self, id: DownloadId) -> Option<&DownloadNode> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: DownloadId) -> Option<&mut DownloadNode> {
        self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
    }

    pub fn top_level_order(&self) -> &[DownloadId] {
        &self.order
    }

    /// Enqueue a new top-level file item at `position` relative to `reference`
    /// (or at the tail if `reference` is `None`).
    pub fn enqueue_file(
        &mut self,
        name: String,
        file_key: u64,
        chunks: Vec<ChunkSlot>,
        reference: Option<(DownloadId, Position)>,
    ) -> DownloadId {
        let id = self.alloc(DownloadNode::new_file(name, None, file_key, chunks));
        self.by_file_key.insert(file_key, id);
        self.insert_at(id, reference);
        id
    }

    pub fn enqueue_directory(&mut self, name: String, reference: Option<(DownloadId, Position)>) -> DownloadId {
        let id = self.alloc(DownloadNode::new_dir(name, None));
        self.insert_at(id, reference);
        id
    }

    /// Add a file as a child of an existing directory item (spec.md §4.G.1 expansion:
    /// directories recurse). Children are not part of the top-level total order.
    pub fn add_child_file(&mut self, parent: DownloadId, name: String, file_key: u64, chunks: Vec<ChunkSlot>) -> DownloadId {
        let id = self.alloc(DownloadNode::new_file(name, Some(parent), file_key, chunks));
        self.by_file_key.insert(file_key, id);
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    pub fn add_child_directory(&mut self, parent: DownloadId, name: String) -> DownloadId {
        let id = self.alloc(DownloadNode::new_dir(name, Some(parent)));
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    fn insert_at(&mut self, id: DownloadId, reference: Option<(DownloadId, Position)>) {
        match reference {
            None => self.order.push(id),
            Some((reference_id, position)) => {
                let at = self
                    .order
                    .iter()
                    .position(|&x| x == reference_id)
                    .unwrap_or(self.order.len());
                let insert_pos = match position {
                    Position::Before => at,
                    Position::After => at + 1,
                };
                self.order.insert(insert_pos.min(self.order.len()), id);
            }
        }
    }

    /// Move `ids` as a contiguous block to `position` of `reference`, preserving their
    /// relative order (spec.md §8 round-trip law, seed 6).
    pub fn move_items(&mut self, ids: &[DownloadId], position: Position, reference: DownloadId) {
        let moving: std::collections::HashSet<DownloadId> = ids.iter().copied().collect();
        self.order.retain(|id| !moving.contains(id));
        let at = self
            .order
            .iter()
            .position(|&x| x == reference)
            .unwrap_or(self.order.len());
        let insert_pos = match position {
            Position::Before => at,
            Position::After => at + 1,
        };
        for (offset, id) in ids.iter().enumerate() {
            self.order.insert((insert_pos + offset).min(self.order.len()), *id);
        }
    }

    pub fn remove(&mut self, id: DownloadId) {
        let children = self.get(id).map(|n| n.children.clone()).unwrap_or_default();
        for child in children {
            self.remove(child);
        }
        if let Some(parent) = self.get(id).and_then(|n| n.parent) {
            if let Some(p) = self.get_mut(parent) {
                p.children.retain(|&c| c != id);
            }
        }
        self.order.retain(|&x| x != id);
        if let Some(slot) = self.nodes.get_mut(id.0 as usize) {
            if let Some(node) = slot.take() {
                if let DownloadKind::File { file_key, .. } = node.kind {
                    self.by_file_key.remove(&file_key);
                }
            }
        }
        self.free.push(id.0);
    }

    pub fn find_by_file_key(&self, file_key: u64) -> Option<DownloadId> {
        self.by_file_key.get(&file_key).copied()
    }

    /// All chunk slots across the whole queue that are ready to be scheduled
    /// (`Queued`, not paused, not blocked by a parent pause).
    pub fn pending_chunks(&self) -> Vec<(DownloadId, usize)> {
        let mut out = Vec::new();
        for &top in &self.order {
            self.collect_pending(top, &mut out);
        }
        out
    }

    fn collect_pending(&self, id: DownloadId, out: &mut Vec<(DownloadId, usize)>) {
        let Some(node) = self.get(id) else { return };
        if node.paused {
            return;
        }
        match &node.kind {
            DownloadKind::File { chunks, .. } => {
                for (i, c) in chunks.iter().enumerate() {
                    if c.status == DownloadStatus::Queued || c.status == DownloadStatus::NoSource {
                        out.push((id, i));
                    }
                }
            }
            DownloadKind::Directory => {
                for &child in &node.children {
                    self.collect_pending(child, out);
                }
            }
        }
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_chunk(hash_byte: u8) -> ChunkSlot {
        ChunkSlot {
            hash: ChunkHash::from_bytes([hash_byte; crate::identity::PEER_ID_LEN]),
            index: 0,
            size: 10,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            source: None,
        }
    }

    #[test]
    fn enqueue_appends_to_tail() {
        let mut q = DownloadQueue::new();
        let a = q.enqueue_file("a".into(), 1, vec![one_chunk(1)], None);
        let b = q.enqueue_file("b".into(), 2, vec![one_chunk(2)], None);
        assert_eq!(q.top_level_order(), &[a, b]);
    }

    #[test]
    fn reordering_matches_seed_six() {
        let mut q = DownloadQueue::new();
        let a = q.enqueue_file("a".into(), 1, vec![one_chunk(1)], None);
        let b = q.enqueue_file("b".into(), 2, vec![one_chunk(2)], None);
        let c = q.enqueue_file("c".into(), 3, vec![one_chunk(3)], None);
        let d = q.enqueue_file("d".into(), 4, vec![one_chunk(4)], None);
        assert_eq!(q.top_level_order(), &[a, b, c, d]);

        q.move_items(&[c], Position::Before, a);
        assert_eq!(q.top_level_order(), &[c, a, b, d]);

        q.move_items(&[a, d], Position::After, b);
        assert_eq!(q.top_level_order(), &[c, b, a, d]);
    }

    #[test]
    fn pending_chunks_recurse_into_directories() {
        let mut q = DownloadQueue::new();
        let dir = q.enqueue_directory("dir".into(), None);
        let _file = q.add_child_file(dir, "f".into(), 1, vec![one_chunk(1), one_chunk(2)]);
        let pending = q.pending_chunks();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn paused_item_has_no_pending_chunks() {
        let mut q = DownloadQueue::new();
        let file = q.enqueue_file("a".into(), 1, vec![one_chunk(1)], None);
        q.get_mut(file).unwrap().paused = true;
        assert!(q.pending_chunks().is_empty());
    }

    #[test]
    fn remove_drops_children_and_index() {
        let mut q = DownloadQueue::new();
        let dir = q.enqueue_directory("dir".into(), None);
        let file = q.add_child_file(dir, "f".into(), 7, vec![one_chunk(1)]);
        q.remove(dir);
        assert!(q.get(file).is_none());
        assert!(q.find_by_file_key(7).is_none());
        assert!(q.top_level_order().is_empty());
    }
}
