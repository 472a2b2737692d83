//! Chunk Source Catalog (spec.md §4.E): read-mostly `ChunkHash -> ChunkHandle` map.
//!
//! Queried by the Upload Engine (to serve a chunk), Discovery (to announce ownership),
//! and the Download Engine (to skip chunks already present). Mutated only by download
//! completion and File Manager rescan events.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::chunk::ChunkHash;
use crate::file_manager::ChunkHandle;

/// Local view of chunks this node can serve, keyed by content hash.
pub struct Catalog {
    entries: RwLock<HashMap<ChunkHash, Arc<dyn ChunkHandle>>>,
}

impl Catalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// O(1) "do I have chunk H?" used by Discovery to decide on a `ChunkOwned` reply.
    pub async fn has(&self, hash: ChunkHash) -> bool {
        self.entries.read().await.contains_key(&hash)
    }

    pub async fn get(&self, hash: ChunkHash) -> Option<Arc<dyn ChunkHandle>> {
        self.entries.read().await.get(&hash).cloned()
    }

    /// Called by the Download Engine when a chunk completes, and by File Manager rescans.
    pub async fn insert(&self, hash: ChunkHash, handle: Arc<dyn ChunkHandle>) {
        self.entries.write().await.insert(hash, handle);
    }

    pub async fn remove(&self, hash: ChunkHash) {
        self.entries.write().await.remove(&hash);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PEER_ID_LEN;

    #[derive(Debug)]
    struct FakeHandle(ChunkHash, u64);
    impl ChunkHandle for FakeHandle {
        fn hash(&self) -> ChunkHash {
            self.0
        }
        fn size(&self) -> u64 {
            self.1
        }
    }

    #[tokio::test]
    async fn absent_until_inserted() {
        let catalog = Catalog::new();
        let hash = ChunkHash::from_bytes([9; PEER_ID_LEN]);
        assert!(!catalog.has(hash).await);
        catalog.insert(hash, Arc::new(FakeHandle(hash, 10))).await;
        assert!(catalog.has(hash).await);
        assert_eq!(catalog.get(hash).await.unwrap().size(), 10);
    }

    #[tokio::test]
    async fn remove_clears_membership() {
        let catalog = Catalog::new();
        let hash = ChunkHash::from_bytes([3; PEER_ID_LEN]);
        catalog.insert(hash, Arc::new(FakeHandle(hash, 1))).await;
        catalog.remove(hash).await;
        assert!(!catalog.has(hash).await);
    }
}
