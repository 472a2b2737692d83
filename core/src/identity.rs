//! Peer identity: a 160-bit id stable for the lifetime of a remote process.
//!
//! The core has no authentication or transfer-stream encryption (non-goal), so a
//! `PeerId` is not tied to a keypair: it is minted once, at process start, from the
//! OS RNG and held for the process lifetime.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const PEER_ID_LEN: usize = 20;

/// 160-bit peer identity, stable for the lifetime of a remote process.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_20")] [u8; PEER_ID_LEN]);

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

impl PeerId {
    /// Mint a fresh random id. Call once per process and keep it.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
