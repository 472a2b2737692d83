//! Chunk Download Engine (spec.md §4.G): the hardest component. Drives a user-ordered
//! queue to completion subject to global/per-peer concurrency caps, source selection,
//! and hash verification.

pub mod chunk_state;
pub mod queue;
pub mod rollup;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, Notify, OnceCell};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::chunk::ChunkHash;
use crate::discovery::InterestSource;
use crate::file_manager::FileManager;
use crate::identity::PeerId;
use crate::integrity::{RollingVerifier, SourceTrust};
use crate::peer::PeerDirectory;
use crate::protocol::{GetChunkStatus, Message, TreeEntry};
use crate::socket_pool::{Direction, PooledStream, SocketPool};

use queue::{ChunkSlot, DownloadId, DownloadQueue, DownloadStatus, Position};
use scheduler::{PendingChunk, SchedulerLimits, SourceCandidate, SourceRegistry};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_SCHEDULING_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;
/// Bounded retries through a fresh stream before a transient transport failure
/// surfaces as a terminal `NO_SOURCE` (spec.md §7).
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct DownloadConfig {
    pub limits: SchedulerLimits,
    pub ack_timeout: Duration,
    pub cooldown: Duration,
    pub read_buffer_size: usize,
    pub scheduling_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            limits: SchedulerLimits::default(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            scheduling_interval: DEFAULT_SCHEDULING_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    ChunkComplete { item: DownloadId, chunk_index: usize },
    ChunkFailed { item: DownloadId, chunk_index: usize, status: DownloadStatus },
    FileComplete { item: DownloadId },
}

/// Chunk key the pure scheduler juggles without knowing about the queue's internals.
#[derive(Clone, Copy)]
struct ChunkKey {
    item: DownloadId,
    index: usize,
}

pub struct DownloadEngine {
    local_id: PeerId,
    config: DownloadConfig,
    queue: Mutex<DownloadQueue>,
    registry: Mutex<SourceRegistry>,
    trust: Mutex<SourceTrust>,
    peer_rates: Mutex<HashMap<PeerId, u64>>,
    active_total: AtomicUsize,
    active_per_peer: Mutex<HashMap<PeerId, usize>>,
    peers: Arc<PeerDirectory>,
    catalog: Arc<Catalog>,
    file_manager: Arc<dyn FileManager>,
    pool: OnceCell<Arc<SocketPool>>,
    events: broadcast::Sender<DownloadEvent>,
    retrigger: Notify,
}

impl DownloadEngine {
    pub fn new(
        local_id: PeerId,
        peers: Arc<PeerDirectory>,
        catalog: Arc<Catalog>,
        file_manager: Arc<dyn FileManager>,
        config: DownloadConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            local_id,
            config,
            queue: Mutex::new(DownloadQueue::new()),
            registry: Mutex::new(SourceRegistry::new()),
            trust: Mutex::new(SourceTrust::new()),
            peer_rates: Mutex::new(HashMap::new()),
            active_total: AtomicUsize::new(0),
            active_per_peer: Mutex::new(HashMap::new()),
            peers,
            catalog,
            file_manager,
            pool: OnceCell::new(),
            events,
            retrigger: Notify::new(),
        })
    }

    pub fn bind_pool(&self, pool: Arc<SocketPool>) {
        let _ = self.pool.set(pool);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// A peer announced it holds `hash` (a `ChunkOwned` reply or a `HashList` entry).
    pub async fn note_source(&self, chunk: ChunkHash, peer: PeerId) {
        self.registry.lock().await.add_source(chunk, peer);
        self.retrigger.notify_one();
    }

    pub async fn note_peer_rate(&self, peer: PeerId, bytes_per_sec: u64) {
        self.peer_rates.lock().await.insert(peer, bytes_per_sec);
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        self.registry.lock().await.remove_peer(peer);
    }

    /// The set of hashes this node is currently trying to fetch, for beacon interest
    /// advertisement (spec.md §4.C); `newest` selects which half of the set to return.
    pub async fn interest_sample(&self, n: usize, newest: bool) -> Vec<ChunkHash> {
        let queue = self.queue.lock().await;
        let mut hashes: Vec<ChunkHash> = queue
            .pending_chunks()
            .into_iter()
            .filter_map(|(item, idx)| queue.get(item).and_then(|node| chunk_hash_at(node, idx)))
            .collect();
        if newest {
            hashes.reverse();
        }
        hashes.truncate(n);
        hashes
    }

    /// Issues `GetEntries` against `peer` for `path` under `shared_root_id` and expands
    /// the resulting tree into the queue (spec.md §4.G.1).
    pub async fn enqueue_remote_path(
        &self,
        peer: PeerId,
        shared_root_id: u64,
        path: Vec<String>,
        reference: Option<(DownloadId, Position)>,
    ) -> std::io::Result<DownloadId> {
        let entries = self.fetch_entries(peer, shared_root_id, path.clone()).await?;
        let mut queue = self.queue.lock().await;
        let root_name = path.last().cloned().unwrap_or_else(|| "root".to_string());

        if entries.len() == 1 && !entries[0].is_dir {
            let entry = &entries[0];
            let id = queue.enqueue_file(root_name, file_key_for(shared_root_id, &entry.path), chunk_slots(entry, peer), reference);
            drop(queue);
            self.register_sources(peer, &entries).await;
            return Ok(id);
        }

        let root = queue.enqueue_directory(root_name, reference);
        for entry in &entries {
            let name = entry.path.last().cloned().unwrap_or_default();
            if entry.is_dir {
                queue.add_child_directory(root, name);
            } else {
                queue.add_child_file(root, name, file_key_for(shared_root_id, &entry.path), chunk_slots(entry, peer));
            }
        }
        drop(queue);
        self.register_sources(peer, &entries).await;
        self.retrigger.notify_one();
        Ok(root)
    }

    async fn register_sources(&self, peer: PeerId, entries: &[TreeEntry]) {
        let mut registry = self.registry.lock().await;
        for entry in entries {
            for hash in &entry.chunk_hashes {
                registry.add_source(*hash, peer);
            }
        }
    }

    async fn fetch_entries(&self, peer: PeerId, shared_root_id: u64, path: Vec<String>) -> std::io::Result<Vec<TreeEntry>> {
        let pool = self.pool.get().expect("socket pool bound before use").clone();
        let mut stream = self.dial(pool.clone(), peer).await?;
        stream
            .send_frame(&Message::GetEntries { shared_root_id, path }, 0, self.local_id)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "encode error"))?;
        let (_, msg) = tokio::time::timeout(self.config.ack_timeout, stream.read_frame())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "GetEntries ack timed out"))?
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        pool.release(stream, true).await;
        match msg {
            Message::GetEntriesResult { entries } => Ok(entries),
            other => {
                warn!(kind = other.kind(), "download: unexpected reply to GetEntries");
                Ok(Vec::new())
            }
        }
    }

    async fn dial(&self, pool: Arc<SocketPool>, peer: PeerId) -> std::io::Result<PooledStream> {
        let addr = self
            .peers
            .get(peer)
            .await
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "peer unknown"))?
            .addr;
        pool.acquire(peer, Direction::Outbound, || async move {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(stream) as Box<dyn crate::socket_pool::Duplex>)
        })
        .await
    }

    pub async fn move_items(&self, ids: &[DownloadId], position: Position, reference: DownloadId) {
        self.queue.lock().await.move_items(ids, position, reference);
    }

    pub async fn queue_top_level(&self) -> Vec<DownloadId> {
        self.queue.lock().await.top_level_order().to_vec()
    }

    /// Long-lived scheduling-trigger task (spec.md §5): timer tick, queue change, or peer
    /// directory event all call `tick()`.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scheduling_interval);
        let mut peer_events = self.peers.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.retrigger.notified() => {}
                event = peer_events.recv() => {
                    if event.is_err() {
                        return;
                    }
                }
            }
            self.tick().await;
        }
    }

    async fn tick(self: &Arc<Self>) {
        let pending_keys: Vec<(DownloadId, usize, ChunkHash)> = {
            let queue = self.queue.lock().await;
            queue
                .pending_chunks()
                .into_iter()
                .filter_map(|(item, idx)| {
                    queue
                        .get(item)
                        .and_then(|node| chunk_hash_at(node, idx))
                        .map(|hash| (item, idx, hash))
                })
                .collect()
        };
        if pending_keys.is_empty() {
            return;
        }

        let pending: Vec<PendingChunk<ChunkKey>> = pending_keys
            .iter()
            .map(|(item, idx, hash)| PendingChunk {
                key: ChunkKey { item: *item, index: *idx },
                hash: *hash,
            })
            .collect();

        let registry = self.registry.lock().await;
        let trust = self.trust.lock().await;
        let rates = self.peer_rates.lock().await;
        let active_per_peer = self.active_per_peer.lock().await.clone();
        let active_total = self.active_total.load(Ordering::Relaxed);

        let (assignments, unsourced) = scheduler::schedule(&pending, self.config.limits, active_total, &active_per_peer, |hash| {
            registry
                .sources_for(hash)
                .iter()
                .filter(|peer| !trust.is_blacklisted(peer, &hash))
                .map(|peer| SourceCandidate {
                    peer: *peer,
                    reported_rate: rates.get(peer).copied().unwrap_or(0),
                    failure_count: trust.failure_count(peer),
                })
                .collect()
        });
        drop(registry);
        drop(trust);
        drop(rates);
        drop(active_per_peer);

        for key in unsourced {
            self.mark_unsourced(key.item, key.index).await;
        }

        for assignment in assignments {
            let key = assignment.key;
            // Flip the chunk out of the pending set before handing it to a worker task.
            // A second tick() can run (the run loop wakes on any peer/queue event) before
            // a freshly spawned worker gets its first poll, and pending_chunks() would
            // otherwise still see this slot as Queued/NoSource and assign it again.
            self.set_chunk_status(key.item, key.index, DownloadStatus::Requesting).await;
            *self.active_per_peer.lock().await.entry(assignment.peer).or_insert(0) += 1;
            self.active_total.fetch_add(1, Ordering::Relaxed);
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run_chunk_worker(key.item, key.index, assignment.peer).await;
            });
        }
    }

    async fn mark_unsourced(&self, item: DownloadId, index: usize) {
        let mut queue = self.queue.lock().await;
        let Some(node) = queue.get_mut(item) else { return };
        let old_status = node.status;
        if let queue::DownloadKind::File { chunks, .. } = &mut node.kind {
            if let Some(chunk) = chunks.get_mut(index) {
                chunk.status = DownloadStatus::NoSource;
            }
        }
        node.status = DownloadStatus::UnknownPeerSource;
        let new_status = node.status;
        rollup::propagate(&mut queue, item, 0, 0, old_status, new_status);
    }

    async fn run_chunk_worker(self: Arc<Self>, item: DownloadId, index: usize, peer: PeerId) {
        // tick() already flipped this chunk to Requesting synchronously before spawning us.
        let hash = {
            let queue = self.queue.lock().await;
            queue.get(item).and_then(|node| chunk_hash_at(node, index))
        };
        let Some(hash) = hash else {
            self.finish_worker(peer).await;
            return;
        };

        // Transient transport failures (dial/write/read) get a bounded number of
        // retries through a fresh stream before surfacing as a terminal NO_SOURCE
        // (spec.md §7 "Transient transport" policy); other outcomes are final already.
        let mut outcome = ChunkOutcome::NoSource;
        for _ in 0..MAX_TRANSIENT_RETRIES {
            outcome = self.attempt_transfer(item, index, hash, peer).await;
            if !matches!(outcome, ChunkOutcome::NoSource) {
                break;
            }
        }
        self.apply_outcome(item, index, hash, peer, outcome).await;
        self.finish_worker(peer).await;
        self.retrigger.notify_one();
    }

    async fn finish_worker(&self, peer: PeerId) {
        self.active_total.fetch_sub(1, Ordering::Relaxed);
        let mut map = self.active_per_peer.lock().await;
        if let Some(count) = map.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }
    }

    async fn attempt_transfer(&self, item: DownloadId, index: usize, hash: ChunkHash, peer: PeerId) -> ChunkOutcome {
        let (offset, chunk_base) = {
            let queue = self.queue.lock().await;
            let chunk = queue.get(item).and_then(|n| queue::DownloadNode::chunk_ref(n, index));
            (
                chunk.map(|c| c.downloaded_bytes).unwrap_or(0),
                chunk.map(|c| c.index as u64 * crate::chunk::DEFAULT_CHUNK_SIZE).unwrap_or(0),
            )
        };

        let pool = match self.pool.get() {
            Some(p) => p.clone(),
            None => return ChunkOutcome::IoError,
        };
        let mut stream = match self.dial(pool.clone(), peer).await {
            Ok(s) => s,
            Err(e) => {
                debug!(%peer, error = %e, "download: failed to dial source");
                return ChunkOutcome::NoSource;
            }
        };

        if stream.send_frame(&Message::GetChunk { hash, offset }, 0, self.local_id).await.is_err() {
            return ChunkOutcome::NoSource;
        }

        let reply = match tokio::time::timeout(self.config.ack_timeout, stream.read_frame()).await {
            Ok(Ok((_, msg))) => msg,
            Ok(Err(_)) | Err(_) => return ChunkOutcome::NoSource,
        };

        let chunk_size = match reply {
            Message::GetChunkResult { status: GetChunkStatus::DontHave, .. } => {
                pool.release(stream, true).await;
                return ChunkOutcome::DontHave;
            }
            Message::GetChunkResult { status: GetChunkStatus::Error, .. } => {
                pool.release(stream, true).await;
                return ChunkOutcome::DontHave;
            }
            Message::GetChunkResult { status: GetChunkStatus::Ok, chunk_size } => chunk_size,
            _ => {
                return ChunkOutcome::NoSource;
            }
        };

        let remaining = chunk_size.saturating_sub(offset);
        let file_key = {
            let queue = self.queue.lock().await;
            queue.get(item).and_then(queue::DownloadNode::file_key).unwrap_or(0)
        };
        let mut writer = match self.file_manager.open_writer(file_key, chunk_base + offset).await {
            Ok(w) => w,
            Err(e) => {
                warn!(%peer, %hash, error = %e, "download: failed to open chunk writer");
                pool.release(stream, false).await;
                return ChunkOutcome::IoError;
            }
        };

        let mut verifier = RollingVerifier::new();
        let mut buf = vec![0u8; self.config.read_buffer_size];
        let mut received: u64 = 0;
        while received < remaining {
            let want = (remaining - received).min(buf.len() as u64) as usize;
            let n = match stream.read_raw(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(%peer, error = %e, "download: stream read failed mid-transfer");
                    pool.release(stream, false).await;
                    return ChunkOutcome::NoSource;
                }
            };
            verifier.update(&buf[..n]);
            if writer.write(&buf[..n]).await.is_err() {
                pool.release(stream, false).await;
                return ChunkOutcome::IoError;
            }
            received += n as u64;
            self.advance_chunk_progress(item, index, n as u64).await;
        }

        if received < remaining {
            pool.release(stream, false).await;
            return ChunkOutcome::NoSource;
        }

        let digest = verifier.finish();
        if ChunkHash::from_full_digest(&digest) != hash {
            pool.release(stream, true).await;
            return ChunkOutcome::HashMismatch;
        }

        if writer.finish().await.is_err() {
            return ChunkOutcome::IoError;
        }
        pool.release(stream, true).await;
        ChunkOutcome::Complete
    }

    async fn advance_chunk_progress(&self, item: DownloadId, index: usize, bytes: u64) {
        let mut queue = self.queue.lock().await;
        let Some(node) = queue.get_mut(item) else { return };
        node.downloaded_bytes += bytes;
        if let queue::DownloadKind::File { chunks, .. } = &mut node.kind {
            if let Some(chunk) = chunks.get_mut(index) {
                chunk.downloaded_bytes += bytes;
            }
        }
        rollup::propagate(&mut queue, item, 0, bytes as i64, node.status, node.status);
    }

    async fn apply_outcome(self: &Arc<Self>, item: DownloadId, index: usize, hash: ChunkHash, peer: PeerId, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::DontHave => {
                self.registry.lock().await.remove_source(hash, peer);
                self.set_chunk_status(item, index, DownloadStatus::Queued).await;
            }
            ChunkOutcome::NoSource => {
                self.set_chunk_status(item, index, DownloadStatus::NoSource).await;
            }
            ChunkOutcome::IoError => {
                self.set_chunk_status(item, index, DownloadStatus::IoError).await;
                let _ = self.events.send(DownloadEvent::ChunkFailed { item, chunk_index: index, status: DownloadStatus::IoError });
            }
            ChunkOutcome::HashMismatch => {
                self.trust.lock().await.record_failure(peer, hash);
                self.set_chunk_status(item, index, DownloadStatus::HashMismatch).await;
                let _ = self.events.send(DownloadEvent::ChunkFailed { item, chunk_index: index, status: DownloadStatus::HashMismatch });
                self.requeue_after_cooldown(item, index);
            }
            ChunkOutcome::Complete => {
                self.set_chunk_status(item, index, DownloadStatus::Complete).await;
                self.file_manager.on_chunk_complete(hash).await;
                if let Some(handle) = self.file_manager.get_chunk(hash).await {
                    self.catalog.insert(hash, Arc::from(handle)).await;
                }
                let _ = self.events.send(DownloadEvent::ChunkComplete { item, chunk_index: index });
                if self.file_complete(item).await {
                    let _ = self.events.send(DownloadEvent::FileComplete { item });
                    info!(?item, "download: file complete");
                }
            }
        }
    }

    fn requeue_after_cooldown(self: &Arc<Self>, item: DownloadId, index: usize) {
        let engine = self.clone();
        let cooldown = self.config.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            engine.set_chunk_status(item, index, DownloadStatus::Queued).await;
            engine.retrigger.notify_one();
        });
    }

    async fn set_chunk_status(&self, item: DownloadId, index: usize, status: DownloadStatus) {
        let mut queue = self.queue.lock().await;
        let Some(node) = queue.get_mut(item) else { return };
        let old_status = node.status;
        if let queue::DownloadKind::File { chunks, .. } = &mut node.kind {
            if let Some(chunk) = chunks.get_mut(index) {
                chunk.status = status;
            }
        }
        let all_complete = matches!(&node.kind, queue::DownloadKind::File { chunks, .. } if chunks.iter().all(ChunkSlot::is_complete));
        node.status = if all_complete { DownloadStatus::Complete } else { status };
        let new_status = node.status;
        rollup::propagate(&mut queue, item, 0, 0, old_status, new_status);
    }

    async fn file_complete(&self, item: DownloadId) -> bool {
        let queue = self.queue.lock().await;
        queue.get(item).map(|n| n.status == DownloadStatus::Complete).unwrap_or(false)
    }
}

#[async_trait]
impl InterestSource for DownloadEngine {
    async fn oldest_interest(&self, n: usize) -> Vec<ChunkHash> {
        self.interest_sample(n, false).await
    }

    async fn newest_interest(&self, n: usize) -> Vec<ChunkHash> {
        self.interest_sample(n, true).await
    }
}

enum ChunkOutcome {
    DontHave,
    NoSource,
    IoError,
    HashMismatch,
    Complete,
}

fn chunk_hash_at(node: &queue::DownloadNode, index: usize) -> Option<ChunkHash> {
    queue::DownloadNode::chunk_ref(node, index).map(|c| c.hash)
}

/// Deterministic file key for a (shared_root_id, path) pair. Exposed so a host can
/// precompute the same key `enqueue_remote_path` will use internally, to register a
/// destination with the File Manager before the transfer that will call `open_writer`
/// with it actually starts.
pub fn file_key_for(shared_root_id: u64, path: &[String]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    shared_root_id.hash(&mut hasher);
    path.hash(&mut hasher);
    hasher.finish()
}

fn chunk_slots(entry: &TreeEntry, source: PeerId) -> Vec<ChunkSlot> {
    entry
        .chunk_hashes
        .iter()
        .enumerate()
        .map(|(i, hash)| {
            let is_last = i + 1 == entry.chunk_hashes.len();
            let size = if is_last && entry.chunk_hashes.len() > 1 {
                entry.size - (entry.chunk_hashes.len() as u64 - 1) * crate::chunk::DEFAULT_CHUNK_SIZE
            } else if entry.chunk_hashes.len() == 1 {
                entry.size
            } else {
                crate::chunk::DEFAULT_CHUNK_SIZE
            };
            ChunkSlot {
                hash: *hash,
                index: i as u32,
                size,
                downloaded_bytes: 0,
                status: DownloadStatus::Queued,
                source: Some(source),
            }
        })
        .collect()
}
