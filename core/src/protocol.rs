//! Wire message types for both the datagram (discovery) and stream (transfer) protocols.
//!
//! Field order and semantics are part of the contract (spec.md §4.A); the encoding itself
//! is bincode, framed by `wire::encode_frame`/`wire::decode_frame`.

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkHash;
use crate::identity::PeerId;

pub const PROTOCOL_VERSION: u8 = 1;

/// Status of a `GetChunkResult` reply.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum GetChunkStatus {
    Ok,
    DontHave,
    Error,
}

/// One matched entry returned by a `Find` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindEntry {
    pub shared_root_id: u64,
    pub path: Vec<String>,
    pub size: u64,
    pub is_dir: bool,
}

/// One entry in a `GetEntriesResult` file tree listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: Vec<String>,
    pub size: u64,
    pub is_dir: bool,
    /// Chunk hashes in order, empty for directories or files whose hash list is unknown yet.
    pub chunk_hashes: Vec<ChunkHash>,
}

/// Every message exchanged on unicast/multicast datagrams or reliable streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Periodic multicast presence beacon (spec.md §4.C).
    ImAlive {
        protocol_version: u8,
        nickname: String,
        listen_port: u16,
        bytes_free: u64,
        bytes_shared: u64,
        download_speed: u64,
        /// Sample of hashes of current interest, rotated oldest/newest per beacon.
        interest_sample: Vec<ChunkHash>,
    },
    /// Unicast reply: "I have chunk H too".
    ChunkOwned {
        hash: ChunkHash,
        listen_port: u16,
    },
    /// Multicast search query.
    Find {
        tag: u32,
        pattern: String,
    },
    /// Unicast reply to a `Find`, tagged with the query's tag.
    FindResult {
        tag: u32,
        entries: Vec<FindEntry>,
    },
    /// Chat message, unicast or multicast; round-trip only.
    Chat {
        text: String,
    },
    /// Request the file tree under a shared-root path.
    GetEntries {
        shared_root_id: u64,
        path: Vec<String>,
    },
    GetEntriesResult {
        entries: Vec<TreeEntry>,
    },
    /// Request the ordered chunk-hash list for a single file.
    GetHashes {
        shared_root_id: u64,
        path: Vec<String>,
    },
    HashList {
        hashes: Vec<ChunkHash>,
    },
    /// Request bytes of a chunk starting at `offset`.
    GetChunk {
        hash: ChunkHash,
        offset: u64,
    },
    /// Reply before the raw byte transfer begins (or DontHave/Error, which ends it there).
    GetChunkResult {
        status: GetChunkStatus,
        /// The chunk's full known size (see DESIGN.md Open Questions: spec.md §6 says the
        /// raw transfer that follows is `chunk_size - offset` bytes, which only holds if
        /// this field is the full size rather than the already-offset-adjusted remainder).
        chunk_size: u64,
    },
    Ping {
        sender: PeerId,
    },
}

impl Message {
    /// Coarse message-type tag stored in the frame header, ahead of the self-describing body.
    pub fn kind(&self) -> u8 {
        match self {
            Message::ImAlive { .. } => 0,
            Message::ChunkOwned { .. } => 1,
            Message::Find { .. } => 2,
            Message::FindResult { .. } => 3,
            Message::Chat { .. } => 4,
            Message::GetEntries { .. } => 5,
            Message::GetEntriesResult { .. } => 6,
            Message::GetHashes { .. } => 7,
            Message::HashList { .. } => 8,
            Message::GetChunk { .. } => 9,
            Message::GetChunkResult { .. } => 10,
            Message::Ping { .. } => 11,
        }
    }
}
