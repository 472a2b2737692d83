//! Chunk Upload Engine (spec.md §4.F): serves chunks to remote peers over reliable
//! streams, driven entirely by inbound `GetChunk` requests handed off by the Socket Pool.
//! Also answers the `GetEntries`/`GetHashes` tree-listing queries a remote Download
//! Engine issues before it can enqueue a file (spec.md §4.G.1, §6) — the inbound
//! dispatcher is the one place on this side that already owns both a `FileManager`
//! handle and the pooled stream, so the query-answering half lives here rather than
//! as a separate responder type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::chunk::ChunkHash;
use crate::file_manager::FileManager;
use crate::identity::PeerId;
use crate::protocol::{GetChunkStatus, Message};
use crate::rate::TransferRateCalculator;
use crate::socket_pool::{InboundDispatcher, PooledStream, SocketPool};
use crate::wire::Header;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UPLOAD_LIFETIME: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct UploadConfig {
    pub read_buffer_size: usize,
    pub socket_buffer_size: usize,
    pub socket_timeout: Duration,
    pub upload_lifetime: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            upload_lifetime: DEFAULT_UPLOAD_LIFETIME,
        }
    }
}

/// Terminal outcomes of an Uploader's state machine (spec.md §4.F "State machine").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UploadOutcome {
    FinishedOk,
    FinishedNetwork,
    FinishedIo,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct UploadFinished {
    pub upload_id: u64,
    pub peer: PeerId,
    pub chunk: ChunkHash,
    pub outcome: UploadOutcome,
}

/// Live record for an in-progress or recently-finished upload, queryable for progress.
pub struct UploadHandle {
    pub id: u64,
    pub peer: PeerId,
    pub chunk: ChunkHash,
    pub chunk_size: u64,
    offset: AtomicU64,
    stop_flag: AtomicBool,
}

impl UploadHandle {
    pub fn progress_permille(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        10_000 * self.offset.load(Ordering::Relaxed) / self.chunk_size
    }

    /// Cooperative cancellation: checked at the next buffer boundary (spec.md §5).
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

pub struct UploadEngine {
    local_id: PeerId,
    catalog: Arc<Catalog>,
    file_manager: Arc<dyn FileManager>,
    rate: Arc<TransferRateCalculator>,
    config: UploadConfig,
    pool: OnceCell<Arc<SocketPool>>,
    next_id: AtomicU64,
    uploaders: RwLock<HashMap<u64, Arc<UploadHandle>>>,
    events: broadcast::Sender<UploadFinished>,
}

impl UploadEngine {
    pub fn new(
        local_id: PeerId,
        catalog: Arc<Catalog>,
        file_manager: Arc<dyn FileManager>,
        rate: Arc<TransferRateCalculator>,
        config: UploadConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            local_id,
            catalog,
            file_manager,
            rate,
            config,
            pool: OnceCell::new(),
            next_id: AtomicU64::new(1),
            uploaders: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Wire the socket pool after construction: the pool needs this engine as its
    /// `InboundDispatcher` at construction time, so the two are tied together afterwards.
    pub fn bind_pool(&self, pool: Arc<SocketPool>) {
        let _ = self.pool.set(pool);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadFinished> {
        self.events.subscribe()
    }

    pub async fn active_uploads(&self) -> Vec<Arc<UploadHandle>> {
        self.uploaders.read().await.values().cloned().collect()
    }

    pub fn upload_rate(&self) -> u64 {
        self.rate.rate_bytes_per_sec()
    }

    async fn release(&self, stream: PooledStream, keep_alive: bool) {
        if let Some(pool) = self.pool.get() {
            pool.release(stream, keep_alive).await;
        }
    }

    async fn handle_get_chunk(&self, mut stream: PooledStream, header: Header, hash: ChunkHash, offset: u64) {
        let peer = header.sender;

        let Some(chunk_handle) = self.catalog.get(hash).await else {
            let reply = Message::GetChunkResult {
                status: GetChunkStatus::DontHave,
                chunk_size: 0,
            };
            if stream.send_frame(&reply, header.tag, self.local_id).await.is_ok() {
                self.release(stream, true).await;
            }
            debug!(%peer, %hash, "upload: chunk not in catalog, replied DONT_HAVE");
            return;
        };

        let chunk_size = chunk_handle.size();
        let reply = Message::GetChunkResult {
            status: GetChunkStatus::Ok,
            chunk_size,
        };
        if let Err(e) = stream.send_frame(&reply, header.tag, self.local_id).await {
            warn!(%peer, error = %e, "upload: failed to send GetChunkResult, dropping stream");
            return;
        }

        let reader = match self.file_manager.open_reader(chunk_handle.as_ref(), offset).await {
            Ok(r) => r,
            Err(e) => {
                warn!(%peer, %hash, error = %e, "upload: failed to open chunk reader");
                self.release(stream, false).await;
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(UploadHandle {
            id,
            peer,
            chunk: hash,
            chunk_size,
            offset: AtomicU64::new(offset),
            stop_flag: AtomicBool::new(false),
        });
        self.uploaders.write().await.insert(id, handle.clone());

        let outcome = self.run_worker(stream, reader, &handle).await;
        let _ = self.events.send(UploadFinished {
            upload_id: id,
            peer,
            chunk: hash,
            outcome,
        });

        // Keep the bookkeeping entry around briefly after finishing so a trailing
        // progress/status query still resolves (spec.md §6 `upload_lifetime_ms`,
        // grounded in ChunkUploader's post-finish retention window before deletion).
        self.expire_after(id, self.config.upload_lifetime).await;
    }

    /// Answers a `GetEntries` request straight from the File Manager's index — no
    /// uploader bookkeeping, no catalog lookup, just a single framed reply (spec.md §6).
    async fn handle_get_entries(&self, mut stream: PooledStream, header: Header, shared_root_id: u64, path: Vec<String>) {
        let entries = self.file_manager.list_entries(shared_root_id, &path).await;
        let reply = Message::GetEntriesResult { entries };
        match stream.send_frame(&reply, header.tag, self.local_id).await {
            Ok(()) => self.release(stream, true).await,
            Err(e) => warn!(peer = %header.sender, error = %e, "upload: failed to send GetEntriesResult"),
        }
    }

    /// Answers a `GetHashes` request for the single file named by `path`, found among
    /// its parent directory's listing (the File Manager has no direct by-path lookup).
    async fn handle_get_hashes(&self, mut stream: PooledStream, header: Header, shared_root_id: u64, path: Vec<String>) {
        let parent = if path.is_empty() { Vec::new() } else { path[..path.len() - 1].to_vec() };
        let hashes = self
            .file_manager
            .list_entries(shared_root_id, &parent)
            .await
            .into_iter()
            .find(|e| e.path == path)
            .map(|e| e.chunk_hashes)
            .unwrap_or_default();
        let reply = Message::HashList { hashes };
        match stream.send_frame(&reply, header.tag, self.local_id).await {
            Ok(()) => self.release(stream, true).await,
            Err(e) => warn!(peer = %header.sender, error = %e, "upload: failed to send HashList"),
        }
    }

    /// Spawns nothing itself — schedules removal of `id` on this same task after it
    /// returns, by blocking only as long as the retention window, then clearing it.
    /// Kept as a plain async call (not a detached task) since `dispatch` already runs
    /// on its own task spawned by the socket pool's idle loop.
    async fn expire_after(&self, id: u64, lifetime: Duration) {
        tokio::time::sleep(lifetime).await;
        self.uploaders.write().await.remove(&id);
    }

    async fn run_worker(
        &self,
        mut stream: PooledStream,
        mut reader: Box<dyn crate::file_manager::ChunkReader>,
        handle: &Arc<UploadHandle>,
    ) -> UploadOutcome {
        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            if handle.stop_flag.load(Ordering::Relaxed) {
                // preempt-at-boundary: checked only between reads, never mid-buffer.
                self.release(stream, true).await;
                return UploadOutcome::Stopped;
            }
            let bytes_read = match reader.read(&mut buf).await {
                Ok(0) => {
                    self.release(stream, true).await;
                    return UploadOutcome::FinishedOk;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "upload: chunk reader failed");
                    self.release(stream, false).await;
                    return UploadOutcome::FinishedIo;
                }
            };

            if let Err(e) = write_with_timeout(
                &mut stream,
                &buf[..bytes_read],
                self.config.socket_buffer_size,
                self.config.socket_timeout,
            )
            .await
            {
                warn!(error = %e, "upload: socket write failed or timed out draining");
                self.release(stream, false).await;
                return UploadOutcome::FinishedNetwork;
            }

            handle.offset.fetch_add(bytes_read as u64, Ordering::Relaxed);
            self.rate.add_data(bytes_read as u64);
        }
    }
}

/// Writes `data` in slices no larger than `socket_buffer_size`, each bounded by `timeout`,
/// matching spec.md §4.F's "stalls if the peer's socket buffer does not drain within
/// `socket_timeout_ms`" rule. `tokio`'s `AsyncWrite` has no portable queued-bytes
/// introspection, so the bound is approximated by timing each bounded-size write rather
/// than polling actual buffer depth.
async fn write_with_timeout(
    stream: &mut PooledStream,
    data: &[u8],
    socket_buffer_size: usize,
    timeout: Duration,
) -> std::io::Result<()> {
    for slice in data.chunks(socket_buffer_size.max(1)) {
        tokio::time::timeout(timeout, stream.write_raw(slice))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "socket drain timeout"))??;
    }
    Ok(())
}

#[async_trait]
impl InboundDispatcher for UploadEngine {
    async fn dispatch(&self, stream: PooledStream, header: Header, message: Message) {
        match message {
            Message::GetChunk { hash, offset } => {
                self.handle_get_chunk(stream, header, hash, offset).await;
            }
            Message::GetEntries { shared_root_id, path } => {
                self.handle_get_entries(stream, header, shared_root_id, path).await;
            }
            Message::GetHashes { shared_root_id, path } => {
                self.handle_get_hashes(stream, header, shared_root_id, path).await;
            }
            Message::Ping { .. } => {
                self.release(stream, true).await;
            }
            other => {
                warn!(kind = other.kind(), "upload: unexpected message on inbound stream");
                self.release(stream, true).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::{ChunkHandle, ChunkReader, ChunkWriter, FileManagerError};
    use crate::protocol::{FindEntry, TreeEntry};
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    #[derive(Debug)]
    struct FakeHandle {
        hash: ChunkHash,
        data: Vec<u8>,
    }

    impl ChunkHandle for FakeHandle {
        fn hash(&self) -> ChunkHash {
            self.hash
        }
        fn size(&self) -> u64 {
            self.data.len() as u64
        }
    }

    struct SliceReader {
        data: Vec<u8>,
        pos: usize,
    }

    #[async_trait]
    impl ChunkReader for SliceReader {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileManagerError> {
            let remaining = &self.data[self.pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct FakeFileManager {
        chunks: StdMutex<HashMap<ChunkHash, Vec<u8>>>,
        entries: Vec<TreeEntry>,
    }

    #[async_trait]
    impl FileManager for FakeFileManager {
        async fn get_chunk(&self, _hash: ChunkHash) -> Option<Box<dyn ChunkHandle>> {
            None
        }

        async fn open_reader(
            &self,
            handle: &dyn ChunkHandle,
            offset: u64,
        ) -> Result<Box<dyn ChunkReader>, FileManagerError> {
            let chunks = self.chunks.lock().unwrap();
            let data = chunks
                .get(&handle.hash())
                .cloned()
                .ok_or(FileManagerError::ChunkDeleted)?;
            Ok(Box::new(SliceReader {
                data,
                pos: offset as usize,
            }))
        }

        async fn open_writer(
            &self,
            _file_key: u64,
            _absolute_offset: u64,
        ) -> Result<Box<dyn ChunkWriter>, FileManagerError> {
            unimplemented!("not exercised by upload tests")
        }

        async fn query(&self, _text_pattern: &str) -> Vec<FindEntry> {
            Vec::new()
        }

        async fn list_entries(&self, _shared_root_id: u64, _path: &[String]) -> Vec<TreeEntry> {
            self.entries.clone()
        }

        async fn on_chunk_complete(&self, _hash: ChunkHash) {}
    }

    async fn test_engine(data: Vec<u8>, hash: ChunkHash) -> Arc<UploadEngine> {
        let catalog = Catalog::new();
        let handle: Arc<dyn ChunkHandle> = Arc::new(FakeHandle { hash, data: data.clone() });
        catalog.insert(hash, handle).await;
        let mut chunks = HashMap::new();
        chunks.insert(hash, data);
        let fm = Arc::new(FakeFileManager {
            chunks: StdMutex::new(chunks),
            entries: Vec::new(),
        });
        let rate = Arc::new(TransferRateCalculator::new());
        UploadEngine::new(PeerId::generate(), catalog, fm, rate, UploadConfig::default())
    }

    #[tokio::test]
    async fn serves_full_chunk_on_get_chunk() {
        let data = vec![7u8; 256];
        let hash = ChunkHash::from_full_digest(&crate::integrity::hash_chunk(&data));
        let engine = test_engine(data.clone(), hash).await;
        let pool = SocketPool::new(engine.clone());
        engine.bind_pool(pool);

        let (mut client, server) = duplex(8192);
        let peer = PeerId::generate();
        let stream = PooledStream::new(peer, crate::socket_pool::Direction::Inbound, Box::new(server));

        let header = Header {
            kind: Message::GetChunk { hash, offset: 0 }.kind(),
            body_len: 0,
            tag: 42,
            sender: peer,
        };
        tokio::spawn(async move {
            engine
                .dispatch(stream, header, Message::GetChunk { hash, offset: 0 })
                .await;
        });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut header_buf = [0u8; crate::wire::HEADER_LEN];
        client.read_exact(&mut header_buf).await.unwrap();
        let body_len = u32::from_le_bytes([header_buf[5], header_buf[6], header_buf[7], header_buf[8]]) as usize;
        let mut body = vec![0u8; body_len];
        client.read_exact(&mut body).await.unwrap();
        let mut full = header_buf.to_vec();
        full.extend_from_slice(&body);
        let (_header, msg, _) = crate::wire::decode_stream_frame(&full).unwrap();
        match msg {
            Message::GetChunkResult { status, chunk_size } => {
                assert_eq!(status, GetChunkStatus::Ok);
                assert_eq!(chunk_size, 256);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let mut received = vec![0u8; 256];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, vec![7u8; 256]);
        let _ = client.shutdown().await;
    }

    #[tokio::test]
    async fn serves_get_entries_from_file_manager_index() {
        let file_hash = ChunkHash::from_bytes([5u8; crate::identity::PEER_ID_LEN]);
        let entries = vec![TreeEntry {
            path: vec!["movie.mkv".to_string()],
            size: 64,
            is_dir: false,
            chunk_hashes: vec![file_hash],
        }];
        let catalog = Catalog::new();
        let fm = Arc::new(FakeFileManager {
            chunks: StdMutex::new(HashMap::new()),
            entries: entries.clone(),
        });
        let rate = Arc::new(TransferRateCalculator::new());
        let engine = UploadEngine::new(PeerId::generate(), catalog, fm, rate, UploadConfig::default());
        let pool = SocketPool::new(engine.clone());
        engine.bind_pool(pool);

        let (mut client, server) = duplex(8192);
        let peer = PeerId::generate();
        let stream = PooledStream::new(peer, crate::socket_pool::Direction::Inbound, Box::new(server));
        let header = Header {
            kind: Message::GetEntries { shared_root_id: 1, path: vec![] }.kind(),
            body_len: 0,
            tag: 9,
            sender: peer,
        };
        tokio::spawn(async move {
            engine
                .dispatch(stream, header, Message::GetEntries { shared_root_id: 1, path: vec![] })
                .await;
        });

        use tokio::io::AsyncReadExt;
        let mut header_buf = [0u8; crate::wire::HEADER_LEN];
        client.read_exact(&mut header_buf).await.unwrap();
        let body_len = u32::from_le_bytes([header_buf[5], header_buf[6], header_buf[7], header_buf[8]]) as usize;
        let mut body = vec![0u8; body_len];
        client.read_exact(&mut body).await.unwrap();
        let mut full = header_buf.to_vec();
        full.extend_from_slice(&body);
        let (_, msg, _) = crate::wire::decode_stream_frame(&full).unwrap();
        match msg {
            Message::GetEntriesResult { entries: got } => assert_eq!(got.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_with_timeout_splits_into_socket_buffer_sized_slices() {
        let (mut client, server) = duplex(8192);
        let peer = PeerId::generate();
        let mut stream = PooledStream::new(peer, crate::socket_pool::Direction::Outbound, Box::new(server));
        let data = vec![9u8; 100];

        let writer = tokio::spawn(async move {
            write_with_timeout(&mut stream, &data, 30, Duration::from_secs(5)).await.unwrap();
        });

        use tokio::io::AsyncReadExt;
        let mut received = vec![0u8; 100];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, vec![9u8; 100]);
        writer.await.unwrap();
    }
}
