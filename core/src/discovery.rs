//! Discovery & Query Transport (spec.md §4.C): multicast presence beacons, unicast
//! chunk-ownership replies, search, and chat, all over UDP datagrams.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::chunk::ChunkHash;
use crate::file_manager::FileManager;
use crate::identity::PeerId;
use crate::peer::{BeaconInfo, PeerDirectory};
use crate::protocol::{FindEntry, Message};
use crate::wire::{self, FrameDecodeError};

pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_UDP_DATAGRAM_SIZE: usize = 8192;

/// Supplies the set of chunk hashes the node is currently trying to fetch, so beacons
/// can advertise interest (spec.md §4.C, §4.G.2).
#[async_trait]
pub trait InterestSource: Send + Sync {
    /// `n` oldest-active hashes, for the "oldest" half of the alternating beacon sample.
    async fn oldest_interest(&self, n: usize) -> Vec<ChunkHash>;
    /// `n` newest-active hashes, for the "newest" half.
    async fn newest_interest(&self, n: usize) -> Vec<ChunkHash>;
}

/// An interest source with nothing active; used before a Download Engine is wired up.
pub struct NoInterest;
#[async_trait]
impl InterestSource for NoInterest {
    async fn oldest_interest(&self, _n: usize) -> Vec<ChunkHash> {
        Vec::new()
    }
    async fn newest_interest(&self, _n: usize) -> Vec<ChunkHash> {
        Vec::new()
    }
}

/// Events other components subscribe to, produced by incoming unicast/multicast traffic.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Chat { from: PeerId, text: String },
    FindResult { tag: u32, from: PeerId, entries: Vec<FindEntry> },
    ChunkOwned { from: PeerId, hash: ChunkHash, addr: SocketAddr },
}

#[derive(Clone)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub unicast_port: u16,
    pub beacon_interval: Duration,
    pub max_udp_datagram_size: usize,
    pub nickname: String,
    pub transfer_listen_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: Ipv4Addr::new(239, 255, 60, 60),
            multicast_port: 45678,
            unicast_port: 45679,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            max_udp_datagram_size: DEFAULT_MAX_UDP_DATAGRAM_SIZE,
            nickname: String::new(),
            transfer_listen_port: 0,
        }
    }
}

/// Suppresses duplicate (tag, sender) pairs seen within a short window (spec.md §4.C
/// "Ordering guarantees").
struct DedupWindow {
    seen: HashMap<(PeerId, u32), std::time::Instant>,
    window: Duration,
}

impl DedupWindow {
    fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
        }
    }

    fn is_duplicate(&mut self, sender: PeerId, tag: u32) -> bool {
        let now = std::time::Instant::now();
        self.seen.retain(|_, t| now.duration_since(*t) < self.window);
        let key = (sender, tag);
        if self.seen.contains_key(&key) {
            true
        } else {
            self.seen.insert(key, now);
            false
        }
    }
}

pub struct Discovery {
    config: DiscoveryConfig,
    local_id: PeerId,
    multicast_socket: UdpSocket,
    unicast_socket: UdpSocket,
    directory: Arc<PeerDirectory>,
    catalog: Arc<Catalog>,
    file_manager: Arc<dyn FileManager>,
    interest: Arc<dyn InterestSource>,
    events: broadcast::Sender<DiscoveryEvent>,
    tag_counter: AtomicU32,
    dedup: Mutex<DedupWindow>,
    rotate_oldest_next: std::sync::atomic::AtomicBool,
    bytes_free: AtomicU64,
    bytes_shared: AtomicU64,
    download_speed: AtomicU64,
}

const INTEREST_SAMPLE_SIZE: usize = 16;

impl Discovery {
    pub async fn bind(
        config: DiscoveryConfig,
        local_id: PeerId,
        directory: Arc<PeerDirectory>,
        catalog: Arc<Catalog>,
        file_manager: Arc<dyn FileManager>,
        interest: Arc<dyn InterestSource>,
    ) -> std::io::Result<Arc<Self>> {
        let multicast_socket = bind_multicast(config.multicast_group, config.multicast_port).await?;
        let unicast_socket = UdpSocket::bind(("0.0.0.0", config.unicast_port)).await?;
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            config,
            local_id,
            multicast_socket,
            unicast_socket,
            directory,
            catalog,
            file_manager,
            interest,
            events,
            tag_counter: AtomicU32::new(1),
            dedup: Mutex::new(DedupWindow::new(Duration::from_millis(1500))),
            rotate_oldest_next: std::sync::atomic::AtomicBool::new(true),
            bytes_free: AtomicU64::new(0),
            bytes_shared: AtomicU64::new(0),
            download_speed: AtomicU64::new(0),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn set_shared_totals(&self, bytes_free: u64, bytes_shared: u64) {
        self.bytes_free.store(bytes_free, Ordering::Relaxed);
        self.bytes_shared.store(bytes_shared, Ordering::Relaxed);
    }

    pub fn set_download_speed(&self, bytes_per_sec: u64) {
        self.download_speed.store(bytes_per_sec, Ordering::Relaxed);
    }

    fn next_tag(&self) -> u32 {
        self.tag_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs the beacon timer and both receive loops until cancelled. Intended to be
    /// spawned as a long-lived task by the host.
    pub async fn run(self: Arc<Self>) {
        let beacon = { let s = self.clone(); tokio::spawn(async move { s.beacon_loop().await }) };
        let multicast_recv = { let s = self.clone(); tokio::spawn(async move { s.multicast_recv_loop().await }) };
        let unicast_recv = { let s = self.clone(); tokio::spawn(async move { s.unicast_recv_loop().await }) };
        let _ = tokio::join!(beacon, multicast_recv, unicast_recv);
    }

    async fn beacon_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.send_beacon().await {
                warn!(error = %e, "discovery: failed to send beacon");
            }
            tokio::time::sleep(self.config.beacon_interval).await;
        }
    }

    async fn send_beacon(&self) -> std::io::Result<()> {
        let rotate_oldest = self.rotate_oldest_next.fetch_xor(true, Ordering::Relaxed);
        let interest_sample = if rotate_oldest {
            self.interest.oldest_interest(INTEREST_SAMPLE_SIZE).await
        } else {
            self.interest.newest_interest(INTEREST_SAMPLE_SIZE).await
        };
        let msg = Message::ImAlive {
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            nickname: self.config.nickname.clone(),
            listen_port: self.config.transfer_listen_port,
            bytes_free: self.bytes_free.load(Ordering::Relaxed),
            bytes_shared: self.bytes_shared.load(Ordering::Relaxed),
            download_speed: self.download_speed.load(Ordering::Relaxed),
            interest_sample,
        };
        self.send_multicast(&msg).await
    }

    async fn send_multicast(&self, msg: &Message) -> std::io::Result<()> {
        let frame = self.encode_capped(msg)?;
        let dest = SocketAddr::new(self.config.multicast_group.into(), self.config.multicast_port);
        self.multicast_socket.send_to(&frame, dest).await?;
        Ok(())
    }

    async fn send_unicast(&self, msg: &Message, dest: SocketAddr) -> std::io::Result<()> {
        let frame = self.encode_capped(msg)?;
        self.unicast_socket.send_to(&frame, dest).await?;
        Ok(())
    }

    fn encode_capped(&self, msg: &Message) -> std::io::Result<Vec<u8>> {
        let frame = wire::encode_datagram(msg, self.next_tag(), self.local_id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        if frame.len() > self.config.max_udp_datagram_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "datagram exceeds configured size cap, rejecting rather than truncating",
            ));
        }
        Ok(frame)
    }

    /// Multicast a search query and return its correlation tag.
    pub async fn search(&self, pattern: String) -> std::io::Result<u32> {
        let tag = self.next_tag();
        let msg = Message::Find { tag, pattern };
        let frame = wire::encode_datagram(&msg, tag, self.local_id)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let dest = SocketAddr::new(self.config.multicast_group.into(), self.config.multicast_port);
        self.multicast_socket.send_to(&frame, dest).await?;
        Ok(tag)
    }

    pub async fn send_chat(&self, text: String, dest: Option<SocketAddr>) -> std::io::Result<()> {
        let msg = Message::Chat { text };
        match dest {
            Some(addr) => self.send_unicast(&msg, addr).await,
            None => self.send_multicast(&msg).await,
        }
    }

    async fn multicast_recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match self.multicast_socket.recv_from(&mut buf).await {
                Ok((n, from)) => self.handle_datagram(&buf[..n], from, true).await,
                Err(e) => {
                    warn!(error = %e, "discovery: multicast recv failed");
                    return;
                }
            }
        }
    }

    async fn unicast_recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            match self.unicast_socket.recv_from(&mut buf).await {
                Ok((n, from)) => self.handle_datagram(&buf[..n], from, false).await,
                Err(e) => {
                    warn!(error = %e, "discovery: unicast recv failed");
                    return;
                }
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr, via_multicast: bool) {
        let (header, msg) = match wire::decode_datagram(bytes) {
            Ok(v) => v,
            Err(FrameDecodeError::WrongMagic) => {
                warn!(%from, "discovery: dropped datagram with wrong magic");
                return;
            }
            Err(FrameDecodeError::BodyTooLarge) => {
                warn!(%from, "discovery: dropped oversize datagram");
                return;
            }
            Err(e) => {
                warn!(%from, error = %e, "discovery: dropped unparseable datagram");
                return;
            }
        };
        if header.sender == self.local_id {
            return;
        }
        {
            let mut dedup = self.dedup.lock().await;
            if dedup.is_duplicate(header.sender, header.tag) {
                debug!(peer = %header.sender, tag = header.tag, "discovery: duplicate suppressed");
                return;
            }
        }
        match msg {
            Message::ImAlive {
                protocol_version,
                nickname,
                listen_port,
                bytes_free,
                bytes_shared,
                download_speed,
                interest_sample,
            } => {
                self.directory
                    .upsert(BeaconInfo {
                        id: header.sender,
                        nickname,
                        addr: SocketAddr::new(from.ip(), listen_port),
                        bytes_free,
                        bytes_shared,
                        protocol_version,
                        download_speed,
                        reachable_unicast: true,
                    })
                    .await;
                for hash in interest_sample {
                    if self.catalog.has(hash).await {
                        let reply = Message::ChunkOwned {
                            hash,
                            listen_port: self.config.transfer_listen_port,
                        };
                        if let Err(e) = self.send_unicast(&reply, from).await {
                            warn!(error = %e, "discovery: failed to send ChunkOwned reply");
                        }
                    }
                }
            }
            Message::ChunkOwned { hash, listen_port } => {
                let _ = self.events.send(DiscoveryEvent::ChunkOwned {
                    from: header.sender,
                    hash,
                    addr: SocketAddr::new(from.ip(), listen_port),
                });
            }
            Message::Find { tag, pattern } => {
                if !via_multicast {
                    return;
                }
                let entries = self.file_manager.query(&pattern).await;
                if entries.is_empty() {
                    return;
                }
                let reply = Message::FindResult { tag, entries };
                if let Err(e) = self.send_unicast(&reply, from).await {
                    warn!(error = %e, "discovery: failed to send FindResult");
                }
            }
            Message::FindResult { tag, entries } => {
                let _ = self.events.send(DiscoveryEvent::FindResult {
                    tag,
                    from: header.sender,
                    entries,
                });
            }
            Message::Chat { text } => {
                let _ = self.events.send(DiscoveryEvent::Chat {
                    from: header.sender,
                    text,
                });
            }
            other => {
                warn!(kind = other.kind(), "discovery: unexpected message type on datagram transport");
            }
        }
    }
}

async fn bind_multicast(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.set_nonblocking(true)?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_window_suppresses_repeat_tag() {
        let mut window = DedupWindow::new(Duration::from_millis(200));
        let peer = PeerId::generate();
        assert!(!window.is_duplicate(peer, 1));
        assert!(window.is_duplicate(peer, 1));
        tokio::time::sleep(Duration::from_millis(220)).await;
        assert!(!window.is_duplicate(peer, 1));
    }
}
