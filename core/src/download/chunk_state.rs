//! Per-chunk state machine (spec.md §4.G.6):
//! `QUEUED -> REQUESTING -> TRANSFERRING -> (COMPLETE | HASH_MISMATCH | IO_ERROR | NO_SOURCE)`
//! with `HASH_MISMATCH`/`NO_SOURCE` re-entering `QUEUED` after a cool-down. `PAUSED` is
//! orthogonal, tracked at the item level in `queue::DownloadNode::paused`.

use super::queue::DownloadStatus;

/// Whether `to` is a legal transition from `from`. Pure, so the scheduler and workers can
/// both assert on it without touching the queue.
pub fn is_valid_transition(from: DownloadStatus, to: DownloadStatus) -> bool {
    use DownloadStatus::*;
    matches!(
        (from, to),
        (Queued, Requesting)
            | (Requesting, Transferring)
            | (Requesting, Queued) // DONT_HAVE / ERROR response, re-scheduled
            | (Requesting, NoSource)
            | (Transferring, Complete)
            | (Transferring, HashMismatch)
            | (Transferring, IoError)
            | (Transferring, NoSource) // source dropped mid-transfer
            | (HashMismatch, Queued)
            | (NoSource, Queued)
            | (IoError, Queued) // retried after a local I/O hiccup
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use DownloadStatus::*;

    #[test]
    fn happy_path_is_valid() {
        assert!(is_valid_transition(Queued, Requesting));
        assert!(is_valid_transition(Requesting, Transferring));
        assert!(is_valid_transition(Transferring, Complete));
    }

    #[test]
    fn complete_is_terminal() {
        assert!(!is_valid_transition(Complete, Queued));
        assert!(!is_valid_transition(Complete, Requesting));
    }

    #[test]
    fn mismatch_and_no_source_requeue() {
        assert!(is_valid_transition(Transferring, HashMismatch));
        assert!(is_valid_transition(HashMismatch, Queued));
        assert!(is_valid_transition(Transferring, NoSource));
        assert!(is_valid_transition(NoSource, Queued));
    }
}
