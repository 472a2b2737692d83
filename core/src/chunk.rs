//! Content-addressed chunk identity, sized the same as a `PeerId` (160 bits).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PEER_ID_LEN;

/// Default chunk size, reflected from the File Manager for compatibility only
/// (spec.md §6 `chunk_size`); the core never cuts files into chunks itself.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Content hash of a chunk's bytes; same width as `PeerId`.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChunkHash(#[serde(with = "bytes_20")] [u8; PEER_ID_LEN]);

mod bytes_20 {
    use super::PEER_ID_LEN;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; PEER_ID_LEN], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; PEER_ID_LEN], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 20 bytes"))
    }
}

impl ChunkHash {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        ChunkHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Truncate a sha2-256 digest to the wire width. The full 256-bit digest is
    /// still what integrity verification hashes against (see `integrity::hash_chunk`);
    /// this is strictly an identity, not the verification hash itself.
    pub fn from_full_digest(digest: &[u8; 32]) -> Self {
        let mut out = [0u8; PEER_ID_LEN];
        out.copy_from_slice(&digest[..PEER_ID_LEN]);
        ChunkHash(out)
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", self)
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A chunk as seen locally: owning file key, index, size, and verified-byte count.
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub hash: ChunkHash,
    pub file_key: u64,
    pub index: u32,
    pub size: u64,
    pub verified_bytes: u64,
}

impl ChunkMeta {
    pub fn is_complete(&self) -> bool {
        self.verified_bytes >= self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_to_wire_width() {
        let digest = [7u8; 32];
        let hash = ChunkHash::from_full_digest(&digest);
        assert_eq!(hash.as_bytes(), &[7u8; PEER_ID_LEN]);
    }

    #[test]
    fn complete_when_verified_equals_size() {
        let meta = ChunkMeta {
            hash: ChunkHash::from_bytes([0; PEER_ID_LEN]),
            file_key: 1,
            index: 0,
            size: 10,
            verified_bytes: 10,
        };
        assert!(meta.is_complete());
    }
}
