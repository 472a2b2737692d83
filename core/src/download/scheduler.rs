//! Scheduling trigger logic (spec.md §4.G.2): decides which pending chunks to start next,
//! subject to the global and per-peer concurrency caps and the source tie-break rule.
//!
//! Kept free of `tokio`/I/O so admission and source-selection math are unit-testable
//! without a runtime, per SPEC_FULL.md §2.

use std::collections::HashMap;

use crate::chunk::ChunkHash;
use crate::identity::PeerId;

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS_PER_PEER: usize = 3;

#[derive(Clone, Copy)]
pub struct SchedulerLimits {
    pub max_concurrent_downloads: usize,
    pub max_concurrent_downloads_per_peer: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_concurrent_downloads_per_peer: DEFAULT_MAX_CONCURRENT_DOWNLOADS_PER_PEER,
        }
    }
}

/// One remote peer known to hold a given chunk, with the stats the tie-break rule uses.
#[derive(Clone, Copy)]
pub struct SourceCandidate {
    pub peer: PeerId,
    pub reported_rate: u64,
    pub failure_count: u32,
}

/// Tracks, per chunk hash, which peers are known to hold it (fed by `ChunkOwned` replies
/// and `GetEntries`/`HashList` responses — spec.md §4.C, §4.G.1). Pure bookkeeping; the
/// actual source liveness comes from the caller combining this with the Peer Directory.
#[derive(Default)]
pub struct SourceRegistry {
    sources: HashMap<ChunkHash, Vec<PeerId>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, chunk: ChunkHash, peer: PeerId) {
        let entry = self.sources.entry(chunk).or_default();
        if !entry.contains(&peer) {
            entry.push(peer);
        }
    }

    /// Called after a `DONT_HAVE` reply (spec.md §4.G.3): drop the peer as a source for
    /// this chunk until a fresh `ChunkOwned`/listing re-adds it.
    pub fn remove_source(&mut self, chunk: ChunkHash, peer: PeerId) {
        if let Some(peers) = self.sources.get_mut(&chunk) {
            peers.retain(|p| *p != peer);
        }
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        for peers in self.sources.values_mut() {
            peers.retain(|p| *p != peer);
        }
    }

    pub fn sources_for(&self, chunk: ChunkHash) -> &[PeerId] {
        self.sources.get(&chunk).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// One chunk the scheduler is considering, identified opaquely by the caller (the queue's
/// own `(DownloadId, chunk index)` pair, kept generic here to stay decoupled from `queue`).
pub struct PendingChunk<T> {
    pub key: T,
    pub hash: ChunkHash,
}

pub struct Assignment<T> {
    pub key: T,
    pub peer: PeerId,
}

/// Picks the best source for `hash` among `candidates`, excluding peers already at their
/// per-peer outstanding cap. Order: fastest-reporting first, then lowest outstanding count,
/// then lower failure count, then `PeerId` bytewise (spec.md §4.G.2 "Source choice").
fn pick_source(
    candidates: &[SourceCandidate],
    outstanding: &HashMap<PeerId, usize>,
    per_peer_cap: usize,
) -> Option<PeerId> {
    candidates
        .iter()
        .filter(|c| outstanding.get(&c.peer).copied().unwrap_or(0) < per_peer_cap)
        .min_by(|a, b| {
            let a_outstanding = outstanding.get(&a.peer).copied().unwrap_or(0);
            let b_outstanding = outstanding.get(&b.peer).copied().unwrap_or(0);
            b.reported_rate
                .cmp(&a.reported_rate)
                .then(a_outstanding.cmp(&b_outstanding))
                .then(a.failure_count.cmp(&b.failure_count))
                .then(a.peer.as_bytes().cmp(b.peer.as_bytes()))
        })
        .map(|c| c.peer)
}

/// Scans `pending` top-down and assembles the set of chunks to start this tick, respecting
/// the global and per-peer caps. `active_per_peer` and `active_total` reflect transfers
/// already in flight before this tick. `lookup_sources` resolves live, non-blacklisted
/// candidates for one chunk (the caller filters blacklist/liveness before calling in).
///
/// Chunks with no available source are returned separately as "no source this tick" so the
/// caller can mark them `UNKNOWN_PEER_SOURCE`/`NO_SOURCE` per spec.md §4.G.2 Admission.
pub fn schedule<T: Clone>(
    pending: &[PendingChunk<T>],
    limits: SchedulerLimits,
    active_total: usize,
    active_per_peer: &HashMap<PeerId, usize>,
    mut lookup_sources: impl FnMut(ChunkHash) -> Vec<SourceCandidate>,
) -> (Vec<Assignment<T>>, Vec<T>) {
    let mut assignments = Vec::new();
    let mut unsourced = Vec::new();
    let mut outstanding = active_per_peer.clone();
    let mut total = active_total;

    for item in pending {
        if total >= limits.max_concurrent_downloads {
            break;
        }
        let candidates = lookup_sources(item.hash);
        match pick_source(&candidates, &outstanding, limits.max_concurrent_downloads_per_peer) {
            Some(peer) => {
                *outstanding.entry(peer).or_insert(0) += 1;
                total += 1;
                assignments.push(Assignment {
                    key: item.key.clone(),
                    peer,
                });
            }
            None => unsourced.push(item.key.clone()),
        }
    }

    (assignments, unsourced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; crate::identity::PEER_ID_LEN])
    }

    fn hash(byte: u8) -> ChunkHash {
        ChunkHash::from_bytes([byte; crate::identity::PEER_ID_LEN])
    }

    #[test]
    fn picks_fastest_source_first() {
        let candidates = vec![
            SourceCandidate { peer: peer(1), reported_rate: 100, failure_count: 0 },
            SourceCandidate { peer: peer(2), reported_rate: 500, failure_count: 0 },
        ];
        let outstanding = HashMap::new();
        assert_eq!(pick_source(&candidates, &outstanding, 3), Some(peer(2)));
    }

    #[test]
    fn breaks_rate_tie_by_lowest_outstanding() {
        let candidates = vec![
            SourceCandidate { peer: peer(1), reported_rate: 100, failure_count: 0 },
            SourceCandidate { peer: peer(2), reported_rate: 100, failure_count: 0 },
        ];
        let mut outstanding = HashMap::new();
        outstanding.insert(peer(1), 2);
        assert_eq!(pick_source(&candidates, &outstanding, 3), Some(peer(2)));
    }

    #[test]
    fn excludes_peers_at_per_peer_cap() {
        let candidates = vec![SourceCandidate { peer: peer(1), reported_rate: 100, failure_count: 0 }];
        let mut outstanding = HashMap::new();
        outstanding.insert(peer(1), 3);
        assert_eq!(pick_source(&candidates, &outstanding, 3), None);
    }

    #[test]
    fn global_cap_stops_further_assignment() {
        let pending = vec![
            PendingChunk { key: 0u32, hash: hash(1) },
            PendingChunk { key: 1u32, hash: hash(2) },
            PendingChunk { key: 2u32, hash: hash(3) },
        ];
        let limits = SchedulerLimits {
            max_concurrent_downloads: 2,
            max_concurrent_downloads_per_peer: 5,
        };
        let (assigned, unsourced) = schedule(&pending, limits, 0, &HashMap::new(), |_| {
            vec![SourceCandidate { peer: peer(9), reported_rate: 10, failure_count: 0 }]
        });
        assert_eq!(assigned.len(), 2);
        assert!(unsourced.is_empty(), "third item simply isn't considered this tick");
    }

    #[test]
    fn chunk_with_no_candidates_is_reported_unsourced() {
        let pending = vec![PendingChunk { key: 0u32, hash: hash(1) }];
        let (assigned, unsourced) = schedule(&pending, SchedulerLimits::default(), 0, &HashMap::new(), |_| Vec::new());
        assert!(assigned.is_empty());
        assert_eq!(unsourced, vec![0]);
    }

    #[test]
    fn per_peer_cap_limits_within_one_tick() {
        let pending: Vec<_> = (0..5u32)
            .map(|i| PendingChunk { key: i, hash: hash(i as u8 + 1) })
            .collect();
        let limits = SchedulerLimits {
            max_concurrent_downloads: 10,
            max_concurrent_downloads_per_peer: 2,
        };
        let (assigned, unsourced) = schedule(&pending, limits, 0, &HashMap::new(), |_| {
            vec![SourceCandidate { peer: peer(9), reported_rate: 10, failure_count: 0 }]
        });
        assert_eq!(assigned.len(), 2);
        assert_eq!(unsourced.len(), 3);
    }
}
