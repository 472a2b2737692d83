//! Peer Directory (spec.md §4.D): single writer, many readers, live set of LAN peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::identity::PeerId;

pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// A remote peer as tracked by the directory (spec.md §3 "Peer").
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub nickname: String,
    pub addr: SocketAddr,
    pub bytes_free: u64,
    pub bytes_shared: u64,
    pub protocol_version: u8,
    pub download_speed: u64,
    pub reachable_unicast: bool,
    pub last_seen: Instant,
}

/// Directory change notifications, consumed by download and UI subscribers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Added(PeerId),
    Updated(PeerId),
    Removed(PeerId),
}

struct Inner {
    peers: HashMap<PeerId, Peer>,
}

/// Live cache of reachable peers on the LAN. The local node's own id is never admitted.
pub struct PeerDirectory {
    local_id: PeerId,
    peer_timeout: Duration,
    inner: RwLock<Inner>,
    events: broadcast::Sender<PeerEvent>,
}

/// Fields carried by an incoming beacon, used to upsert a directory entry.
pub struct BeaconInfo {
    pub id: PeerId,
    pub nickname: String,
    pub addr: SocketAddr,
    pub bytes_free: u64,
    pub bytes_shared: u64,
    pub protocol_version: u8,
    pub download_speed: u64,
    pub reachable_unicast: bool,
}

impl PeerDirectory {
    pub fn new(local_id: PeerId) -> Arc<Self> {
        Self::with_timeout(local_id, DEFAULT_PEER_TIMEOUT)
    }

    pub fn with_timeout(local_id: PeerId, peer_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            local_id,
            peer_timeout,
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Upsert on every incoming beacon (spec.md invariant 1: local id is never admitted).
    pub async fn upsert(&self, info: BeaconInfo) {
        if info.id == self.local_id {
            return;
        }
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let event = if let Some(existing) = inner.peers.get_mut(&info.id) {
            existing.nickname = info.nickname;
            existing.addr = info.addr;
            existing.bytes_free = info.bytes_free;
            existing.bytes_shared = info.bytes_shared;
            existing.protocol_version = info.protocol_version;
            existing.download_speed = info.download_speed;
            existing.reachable_unicast = info.reachable_unicast;
            existing.last_seen = now;
            PeerEvent::Updated(info.id)
        } else {
            inner.peers.insert(
                info.id,
                Peer {
                    id: info.id,
                    nickname: info.nickname,
                    addr: info.addr,
                    bytes_free: info.bytes_free,
                    bytes_shared: info.bytes_shared,
                    protocol_version: info.protocol_version,
                    download_speed: info.download_speed,
                    reachable_unicast: info.reachable_unicast,
                    last_seen: now,
                },
            );
            PeerEvent::Added(info.id)
        };
        drop(inner);
        debug!(peer = %info.id, "peer directory upsert");
        let _ = self.events.send(event);
    }

    /// Evict entries older than the configured peer timeout. Returns the evicted ids.
    pub async fn evict_stale(&self) -> Vec<PeerId> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let timeout = self.peer_timeout;
        let stale: Vec<PeerId> = inner
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.peers.remove(id);
        }
        drop(inner);
        for id in &stale {
            info!(peer = %id, "peer evicted after timeout");
            let _ = self.events.send(PeerEvent::Removed(*id));
        }
        stale
    }

    pub async fn get(&self, id: PeerId) -> Option<Peer> {
        self.inner.read().await.peers.get(&id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.inner.read().await.peers.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_beacon(id: PeerId) -> BeaconInfo {
        BeaconInfo {
            id,
            nickname: "alice".into(),
            addr: "127.0.0.1:1234".parse().unwrap(),
            bytes_free: 0,
            bytes_shared: 0,
            protocol_version: 1,
            download_speed: 0,
            reachable_unicast: true,
        }
    }

    #[tokio::test]
    async fn local_id_never_admitted() {
        let local = PeerId::generate();
        let dir = PeerDirectory::new(local);
        dir.upsert(sample_beacon(local)).await;
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn upsert_then_evict() {
        let local = PeerId::generate();
        let remote = PeerId::generate();
        let dir = PeerDirectory::with_timeout(local, Duration::from_millis(10));
        dir.upsert(sample_beacon(remote)).await;
        assert_eq!(dir.len().await, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let evicted = dir.evict_stale().await;
        assert_eq!(evicted, vec![remote]);
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn repeated_beacon_updates_not_duplicates() {
        let local = PeerId::generate();
        let remote = PeerId::generate();
        let dir = PeerDirectory::new(local);
        dir.upsert(sample_beacon(remote)).await;
        dir.upsert(sample_beacon(remote)).await;
        assert_eq!(dir.len().await, 1);
    }
}
