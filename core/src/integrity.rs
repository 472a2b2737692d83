//! Integrity: chunk content hashing, rolling verification while bytes stream in, and
//! per-peer source trust tracking for the cooldown/blacklist policy (spec.md §4.G.3, §7).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::chunk::ChunkHash;
use crate::identity::PeerId;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Hash a complete chunk payload.
pub fn hash_chunk(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

pub fn verify_chunk(payload: &[u8], expected: &[u8; 32]) -> bool {
    hash_chunk(payload) == *expected
}

/// Feeds bytes in as they stream off the wire, without buffering the whole chunk twice.
pub struct RollingVerifier {
    hasher: Sha256,
}

impl RollingVerifier {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }

    pub fn finish_and_verify(self, expected: &[u8; 32]) -> bool {
        self.finish() == *expected
    }
}

impl Default for RollingVerifier {
    fn default() -> Self {
        Self::new()
    }
}

struct TrustEntry {
    failures: u32,
    blacklist: HashMap<ChunkHash, Instant>,
}

/// Tracks integrity failures and per-chunk cooldowns per peer (spec.md §7 Data integrity).
pub struct SourceTrust {
    cooldown: Duration,
    peers: HashMap<PeerId, TrustEntry>,
}

impl SourceTrust {
    pub fn new() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            cooldown,
            peers: HashMap::new(),
        }
    }

    /// Record a hash-mismatch from `peer` for `chunk`; blacklists the pair for the cooldown.
    pub fn record_failure(&mut self, peer: PeerId, chunk: ChunkHash) {
        let entry = self.peers.entry(peer).or_insert_with(|| TrustEntry {
            failures: 0,
            blacklist: HashMap::new(),
        });
        entry.failures += 1;
        entry.blacklist.insert(chunk, Instant::now());
    }

    pub fn failure_count(&self, peer: &PeerId) -> u32 {
        self.peers.get(peer).map(|e| e.failures).unwrap_or(0)
    }

    /// Whether `peer` is currently cooling down for `chunk`.
    pub fn is_blacklisted(&self, peer: &PeerId, chunk: &ChunkHash) -> bool {
        self.peers
            .get(peer)
            .and_then(|e| e.blacklist.get(chunk))
            .map(|since| Instant::now().duration_since(*since) < self.cooldown)
            .unwrap_or(false)
    }
}

impl Default for SourceTrust {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verify_roundtrip() {
        let payload = b"some chunk bytes";
        let hash = hash_chunk(payload);
        assert!(verify_chunk(payload, &hash));
    }

    #[test]
    fn rolling_verifier_matches_one_shot() {
        let payload = b"streamed in two pieces";
        let mut verifier = RollingVerifier::new();
        verifier.update(&payload[..10]);
        verifier.update(&payload[10..]);
        assert_eq!(verifier.finish(), hash_chunk(payload));
    }

    #[test]
    fn blacklist_expires_after_cooldown() {
        let peer = PeerId::generate();
        let chunk = ChunkHash::from_bytes([1; crate::identity::PEER_ID_LEN]);
        let mut trust = SourceTrust::with_cooldown(Duration::from_millis(10));
        assert!(!trust.is_blacklisted(&peer, &chunk));
        trust.record_failure(peer, chunk);
        assert!(trust.is_blacklisted(&peer, &chunk));
        assert_eq!(trust.failure_count(&peer), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!trust.is_blacklisted(&peer, &chunk));
    }
}
