//! Narrow interface to the externally-owned File Manager (spec.md §1, §6).
//!
//! The core never touches a filesystem path directly: it requests chunks by hash and
//! reads/writes bytes through these handles. A host wires a concrete implementation at
//! construction time.

use async_trait::async_trait;

use crate::chunk::ChunkHash;
use crate::protocol::{FindEntry, TreeEntry};

/// Opaque handle to a chunk's byte storage, owned by the File Manager.
pub trait ChunkHandle: Send + Sync + std::fmt::Debug {
    fn hash(&self) -> ChunkHash;
    fn size(&self) -> u64;
}

#[derive(Debug, thiserror::Error)]
pub enum FileManagerError {
    #[error("unable to open chunk for reading")]
    UnableToOpen,
    #[error("local I/O error")]
    IoError,
    #[error("chunk was deleted locally")]
    ChunkDeleted,
    #[error("chunk data is not yet known locally")]
    DataUnknown,
}

/// A byte-range reader bound to one chunk, positioned at construction.
#[async_trait]
pub trait ChunkReader: Send {
    /// Read up to `buf.len()` bytes, returning 0 at EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FileManagerError>;
}

/// A byte-range writer bound to an absolute file offset.
#[async_trait]
pub trait ChunkWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), FileManagerError>;
    async fn finish(&mut self) -> Result<(), FileManagerError>;
}

/// External collaborator: filesystem scanning, hash tree construction, chunk I/O.
#[async_trait]
pub trait FileManager: Send + Sync {
    async fn get_chunk(&self, hash: ChunkHash) -> Option<Box<dyn ChunkHandle>>;

    async fn open_reader(
        &self,
        handle: &dyn ChunkHandle,
        offset: u64,
    ) -> Result<Box<dyn ChunkReader>, FileManagerError>;

    async fn open_writer(
        &self,
        file_key: u64,
        absolute_offset: u64,
    ) -> Result<Box<dyn ChunkWriter>, FileManagerError>;

    async fn query(&self, text_pattern: &str) -> Vec<FindEntry>;

    async fn list_entries(&self, shared_root_id: u64, path: &[String]) -> Vec<TreeEntry>;

    /// Callback: the Download Engine has verified and completed this chunk.
    async fn on_chunk_complete(&self, hash: ChunkHash);
}
