//! Trivial in-memory/filesystem-backed `FileManager` (SPEC_FULL.md §2): scans the
//! configured shared directories once at startup and serves chunk bytes straight off
//! disk, so the daemon can exchange real files with peers on a LAN without a real
//! filesystem-watching, incremental-rehash implementation behind it.
//!
//! Known simplification: a chunk written by a resumed (non-zero-offset) download has its
//! registered hash computed only over the bytes this particular writer saw, not the whole
//! chunk. Fresh transfers (the common case) start at offset 0, where this is exact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use meshcast_core::chunk::{ChunkHash, DEFAULT_CHUNK_SIZE};
use meshcast_core::file_manager::{ChunkHandle, ChunkReader, ChunkWriter, FileManager, FileManagerError};
use meshcast_core::protocol::{FindEntry, TreeEntry};

#[derive(Debug, Clone)]
struct LocalChunkHandle {
    hash: ChunkHash,
    size: u64,
}

impl ChunkHandle for LocalChunkHandle {
    fn hash(&self) -> ChunkHash {
        self.hash
    }
    fn size(&self) -> u64 {
        self.size
    }
}

/// Where one chunk's bytes live: an absolute file path plus a byte range within it.
#[derive(Debug, Clone)]
struct ChunkRecord {
    path: PathBuf,
    offset: u64,
    size: u64,
    /// False for a download's chunk between `open_writer`'s `finish()` and the engine's
    /// `on_chunk_complete` callback — not yet catalog-visible.
    available: bool,
}

#[derive(Debug, Clone)]
struct SharedFile {
    root_id: u64,
    rel_path: Vec<String>,
    size: u64,
    chunk_hashes: Vec<ChunkHash>,
}

pub struct LocalFileManager {
    shared_files: Vec<SharedFile>,
    chunks: Arc<RwLock<HashMap<ChunkHash, ChunkRecord>>>,
    downloads: RwLock<HashMap<u64, PathBuf>>,
}

impl LocalFileManager {
    /// Scans `shared_dirs` synchronously (blocking I/O, hashing every file) and returns
    /// the manager ready to serve. Call before the Tokio runtime starts taking inbound
    /// traffic — a rescan-while-running isn't implemented by this stand-in.
    pub fn scan(shared_dirs: &[PathBuf]) -> std::io::Result<Self> {
        let mut shared_files = Vec::new();
        let mut chunks = HashMap::new();
        for (i, root) in shared_dirs.iter().enumerate() {
            let root_id = (i + 1) as u64;
            if !root.exists() {
                warn!(path = %root.display(), "daemon: configured shared dir does not exist, skipping");
                continue;
            }
            walk(root, root, root_id, &mut shared_files, &mut chunks)?;
        }
        Ok(Self {
            shared_files,
            chunks: Arc::new(RwLock::new(chunks)),
            downloads: RwLock::new(HashMap::new()),
        })
    }

    /// Tell the manager where a pending download's bytes should land, keyed by the same
    /// `file_key` the Download Engine will pass to `open_writer`. Must be called before
    /// the corresponding `enqueue_remote_path` transfer starts writing.
    pub async fn register_download(&self, file_key: u64, dest_path: PathBuf) {
        self.downloads.write().await.insert(file_key, dest_path);
    }
}

fn walk(
    root: &Path,
    dir: &Path,
    root_id: u64,
    shared_files: &mut Vec<SharedFile>,
    chunks: &mut HashMap<ChunkHash, ChunkRecord>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, root_id, shared_files, chunks)?;
        } else if file_type.is_file() {
            let rel_path: Vec<String> = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let data = std::fs::read(&path)?;
            let size = data.len() as u64;
            let mut chunk_hashes = Vec::new();
            let mut offset = 0u64;
            for span in data.chunks(DEFAULT_CHUNK_SIZE as usize) {
                let mut hasher = Sha256::new();
                hasher.update(span);
                let digest: [u8; 32] = hasher.finalize().into();
                let hash = ChunkHash::from_full_digest(&digest);
                chunk_hashes.push(hash);
                chunks.insert(
                    hash,
                    ChunkRecord {
                        path: path.clone(),
                        offset,
                        size: span.len() as u64,
                        available: true,
                    },
                );
                offset += span.len() as u64;
            }
            debug!(path = %path.display(), chunks = chunk_hashes.len(), "daemon: indexed shared file");
            shared_files.push(SharedFile {
                root_id,
                rel_path,
                size,
                chunk_hashes,
            });
        }
    }
    Ok(())
}

struct FileChunkReader {
    file: File,
    remaining: u64,
}

#[async_trait]
impl ChunkReader for FileChunkReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileManagerError> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (self.remaining as usize).min(buf.len());
        let n = self.file.read(&mut buf[..want]).await.map_err(|_| FileManagerError::IoError)?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

struct FileChunkWriter {
    file: File,
    dest: PathBuf,
    start_offset: u64,
    written: u64,
    hasher: Sha256,
    chunks: Arc<RwLock<HashMap<ChunkHash, ChunkRecord>>>,
}

#[async_trait]
impl ChunkWriter for FileChunkWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<(), FileManagerError> {
        self.file.write_all(buf).await.map_err(|_| FileManagerError::IoError)?;
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Registers a provisional `ChunkRecord` under the hash of exactly what this writer
    /// wrote (see module docs: exact for a fresh, offset-0 transfer). The engine already
    /// holds the verified hash separately and calls `on_chunk_complete` with it right
    /// after this; that callback is what flips `available` to true.
    async fn finish(&mut self) -> Result<(), FileManagerError> {
        self.file.flush().await.map_err(|_| FileManagerError::IoError)?;
        let digest: [u8; 32] = self.hasher.clone().finalize().into();
        let hash = ChunkHash::from_full_digest(&digest);
        self.chunks.write().await.insert(
            hash,
            ChunkRecord {
                path: self.dest.clone(),
                offset: self.start_offset,
                size: self.written,
                available: false,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl FileManager for LocalFileManager {
    async fn get_chunk(&self, hash: ChunkHash) -> Option<Box<dyn ChunkHandle>> {
        let chunks = self.chunks.read().await;
        let record = chunks.get(&hash)?;
        if !record.available {
            return None;
        }
        Some(Box::new(LocalChunkHandle { hash, size: record.size }))
    }

    async fn open_reader(&self, handle: &dyn ChunkHandle, offset: u64) -> Result<Box<dyn ChunkReader>, FileManagerError> {
        let record = {
            let chunks = self.chunks.read().await;
            chunks.get(&handle.hash()).cloned().ok_or(FileManagerError::ChunkDeleted)?
        };
        let mut file = File::open(&record.path).await.map_err(|_| FileManagerError::UnableToOpen)?;
        file.seek(SeekFrom::Start(record.offset + offset))
            .await
            .map_err(|_| FileManagerError::IoError)?;
        Ok(Box::new(FileChunkReader {
            file,
            remaining: record.size.saturating_sub(offset),
        }))
    }

    async fn open_writer(&self, file_key: u64, absolute_offset: u64) -> Result<Box<dyn ChunkWriter>, FileManagerError> {
        let dest = {
            let downloads = self.downloads.read().await;
            downloads.get(&file_key).cloned().ok_or(FileManagerError::DataUnknown)?
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|_| FileManagerError::IoError)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&dest)
            .await
            .map_err(|_| FileManagerError::UnableToOpen)?;
        file.seek(SeekFrom::Start(absolute_offset)).await.map_err(|_| FileManagerError::IoError)?;
        Ok(Box::new(FileChunkWriter {
            file,
            dest,
            start_offset: absolute_offset,
            written: 0,
            hasher: Sha256::new(),
            chunks: self.chunks.clone(),
        }))
    }

    async fn query(&self, text_pattern: &str) -> Vec<FindEntry> {
        let pattern = text_pattern.to_lowercase();
        self.shared_files
            .iter()
            .filter(|f| f.rel_path.last().map(|n| n.to_lowercase().contains(&pattern)).unwrap_or(false))
            .take(100)
            .map(|f| FindEntry {
                shared_root_id: f.root_id,
                path: f.rel_path.clone(),
                size: f.size,
                is_dir: false,
            })
            .collect()
    }

    async fn list_entries(&self, shared_root_id: u64, path: &[String]) -> Vec<TreeEntry> {
        let mut dirs_seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for f in &self.shared_files {
            if f.root_id != shared_root_id || f.rel_path.len() <= path.len() || &f.rel_path[..path.len()] != path {
                continue;
            }
            let next = &f.rel_path[path.len()];
            if f.rel_path.len() == path.len() + 1 {
                out.push(TreeEntry {
                    path: f.rel_path.clone(),
                    size: f.size,
                    is_dir: false,
                    chunk_hashes: f.chunk_hashes.clone(),
                });
            } else if dirs_seen.insert(next.clone()) {
                let mut dir_path = path.to_vec();
                dir_path.push(next.clone());
                out.push(TreeEntry {
                    path: dir_path,
                    size: 0,
                    is_dir: true,
                    chunk_hashes: Vec::new(),
                });
            }
        }
        out
    }

    /// Finalizes the provisional record a `FileChunkWriter` left behind under its own
    /// recomputed hash, making it visible to `get_chunk`/the catalog.
    async fn on_chunk_complete(&self, hash: ChunkHash) {
        if let Some(record) = self.chunks.write().await.get_mut(&hash) {
            record.available = true;
        }
    }
}
