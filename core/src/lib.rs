//! LAN file-sharing core: peer discovery, a chunk source catalog, a pooled transfer
//! transport, and upload/download engines built on top of it. Host-driven: the core
//! owns no configuration file or CLI surface of its own, and never touches a
//! filesystem path directly — a `FileManager` implementation is wired in at
//! construction time by the daemon that embeds this crate.

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod discovery;
pub mod download;
pub mod file_manager;
pub mod identity;
pub mod integrity;
pub mod peer;
pub mod protocol;
pub mod rate;
pub mod settings;
pub mod socket_pool;
pub mod upload;
pub mod wire;

pub use catalog::Catalog;
pub use chunk::{ChunkHash, ChunkMeta};
pub use config::{Config, ConfigError};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryEvent, InterestSource, NoInterest};
pub use download::{file_key_for, DownloadConfig, DownloadEngine, DownloadEvent};
pub use file_manager::{ChunkHandle, ChunkReader, ChunkWriter, FileManager, FileManagerError};
pub use identity::PeerId;
pub use peer::{Peer, PeerDirectory, PeerEvent};
pub use protocol::{FindEntry, GetChunkStatus, Message, TreeEntry, PROTOCOL_VERSION};
pub use settings::{SettingsError, SettingsStore};
pub use socket_pool::{Direction, Duplex, InboundDispatcher, PooledStream, SocketPool};
pub use upload::{UploadConfig, UploadEngine, UploadFinished};
pub use wire::{FrameDecodeError, FrameEncodeError};
