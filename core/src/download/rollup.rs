//! Directory status/byte rollup (spec.md §4.G.5), incremental on every child transition.
//!
//! Grounded in `DownloadsTreeModel::updateDirectories` (original_source/D-LAN GUI): a
//! child's size/downloaded-byte delta and status transition walk up the parent chain,
//! updating running `nb_error`/`nb_paused`/`nb_downloading` counters so the rollup stays
//! O(depth) per event rather than re-scanning every descendant.

use super::queue::{DownloadQueue, DownloadId, DownloadStatus};

/// Recompute one directory's status from its counters, per the table in spec.md §4.G.5.
fn derive_status(size: u64, downloaded_bytes: u64, nb_error: u32, nb_paused: u32, nb_downloading: u32, error_status: DownloadStatus) -> DownloadStatus {
    if downloaded_bytes >= size {
        DownloadStatus::Complete
    } else if nb_error > 0 {
        error_status
    } else if nb_paused > 0 {
        DownloadStatus::Paused
    } else if nb_downloading > 0 {
        DownloadStatus::Downloading
    } else {
        DownloadStatus::Queued
    }
}

/// Apply a byte/status delta for `entry` and propagate it up through every ancestor.
/// `old_status`/`new_status` must be the entry's status immediately before/after the
/// mutation that triggered this call (a no-op delta with an unchanged status short-circuits).
pub fn propagate(queue: &mut DownloadQueue, entry: DownloadId, size_delta: i64, downloaded_delta: i64, old_status: DownloadStatus, new_status: DownloadStatus) {
    if size_delta == 0 && downloaded_delta == 0 && old_status == new_status {
        return;
    }

    let mut current = queue.get(entry).and_then(|n| n.parent);
    while let Some(dir_id) = current {
        let Some(dir) = queue.get_mut(dir_id) else { break };

        dir.size = apply_delta(dir.size, size_delta);
        dir.downloaded_bytes = apply_delta(dir.downloaded_bytes, downloaded_delta);

        adjust_counter(&mut dir.nb_error, old_status.is_error(), new_status.is_error());
        adjust_counter(&mut dir.nb_paused, old_status == DownloadStatus::Paused, new_status == DownloadStatus::Paused);
        adjust_counter(&mut dir.nb_downloading, old_status == DownloadStatus::Downloading, new_status == DownloadStatus::Downloading);

        if new_status.is_error() {
            dir.error_status = Some(new_status);
        }
        if dir.nb_error == 0 {
            dir.error_status = None;
        }
        let error_status = dir.error_status.unwrap_or(new_status);
        dir.status = derive_status(dir.size, dir.downloaded_bytes, dir.nb_error, dir.nb_paused, dir.nb_downloading, error_status);

        current = dir.parent;
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value + delta as u64
    } else {
        value.saturating_sub((-delta) as u64)
    }
}

fn adjust_counter(counter: &mut u32, was: bool, is: bool) {
    match (was, is) {
        (false, true) => *counter += 1,
        (true, false) => *counter = counter.saturating_sub(1),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkHash;
    use crate::download::queue::{ChunkSlot, Position};

    fn chunk(b: u8, size: u64) -> ChunkSlot {
        ChunkSlot {
            hash: ChunkHash::from_bytes([b; crate::identity::PEER_ID_LEN]),
            index: 0,
            size,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            source: None,
        }
    }

    #[test]
    fn directory_becomes_complete_when_bytes_match_size() {
        let mut q = DownloadQueue::new();
        let dir = q.enqueue_directory("d".into(), None);
        let file = q.add_child_file(dir, "f".into(), 1, vec![chunk(1, 10)]);

        propagate(&mut q, file, 10, 0, DownloadStatus::Queued, DownloadStatus::Queued);
        assert_eq!(q.get(dir).unwrap().size, 10);

        propagate(&mut q, file, 0, 10, DownloadStatus::Downloading, DownloadStatus::Complete);
        let dir_node = q.get(dir).unwrap();
        assert_eq!(dir_node.downloaded_bytes, 10);
        assert_eq!(dir_node.status, DownloadStatus::Complete);
    }

    #[test]
    fn error_child_sets_directory_error_status() {
        let mut q = DownloadQueue::new();
        let dir = q.enqueue_directory("d".into(), None);
        let file = q.add_child_file(dir, "f".into(), 1, vec![chunk(1, 10)]);
        propagate(&mut q, file, 10, 0, DownloadStatus::Queued, DownloadStatus::Queued);

        propagate(&mut q, file, 0, 0, DownloadStatus::Downloading, DownloadStatus::HashMismatch);
        let dir_node = q.get(dir).unwrap();
        assert_eq!(dir_node.nb_error, 1);
        assert_eq!(dir_node.status, DownloadStatus::HashMismatch);
    }

    #[test]
    fn sibling_downloading_keeps_directory_downloading_after_one_completes() {
        let mut q = DownloadQueue::new();
        let dir = q.enqueue_directory("d".into(), None);
        let f1 = q.add_child_file(dir, "f1".into(), 1, vec![chunk(1, 10)]);
        let f2 = q.add_child_file(dir, "f2".into(), 2, vec![chunk(2, 10)]);
        propagate(&mut q, f1, 10, 0, DownloadStatus::Queued, DownloadStatus::Queued);
        propagate(&mut q, f2, 10, 0, DownloadStatus::Queued, DownloadStatus::Queued);

        propagate(&mut q, f1, 0, 0, DownloadStatus::Queued, DownloadStatus::Downloading);
        propagate(&mut q, f2, 0, 0, DownloadStatus::Queued, DownloadStatus::Downloading);
        propagate(&mut q, f1, 0, 10, DownloadStatus::Downloading, DownloadStatus::Complete);

        let dir_node = q.get(dir).unwrap();
        assert_eq!(dir_node.downloaded_bytes, 10);
        assert_eq!(dir_node.status, DownloadStatus::Downloading);
        let _ = Position::Before;
    }

    #[test]
    fn error_sibling_keeps_directory_in_error_status_while_other_progresses() {
        let mut q = DownloadQueue::new();
        let dir = q.enqueue_directory("d".into(), None);
        let f1 = q.add_child_file(dir, "f1".into(), 1, vec![chunk(1, 10)]);
        let f2 = q.add_child_file(dir, "f2".into(), 2, vec![chunk(2, 10)]);
        propagate(&mut q, f1, 10, 0, DownloadStatus::Queued, DownloadStatus::Queued);
        propagate(&mut q, f2, 10, 0, DownloadStatus::Queued, DownloadStatus::Queued);

        propagate(&mut q, f1, 0, 0, DownloadStatus::Downloading, DownloadStatus::HashMismatch);
        assert_eq!(q.get(dir).unwrap().status, DownloadStatus::HashMismatch);

        // f2 makes progress while f1 is still broken: the directory must not drift
        // to Downloading/Complete just because the propagating child looks healthy.
        propagate(&mut q, f2, 0, 0, DownloadStatus::Queued, DownloadStatus::Downloading);
        let dir_node = q.get(dir).unwrap();
        assert_eq!(dir_node.nb_error, 1);
        assert_eq!(dir_node.status, DownloadStatus::HashMismatch);

        propagate(&mut q, f2, 0, 10, DownloadStatus::Downloading, DownloadStatus::Complete);
        let dir_node = q.get(dir).unwrap();
        assert_eq!(dir_node.status, DownloadStatus::HashMismatch);
    }
}
