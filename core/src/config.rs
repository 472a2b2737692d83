//! Aggregate configuration snapshot (spec.md §6 "Configuration").
//!
//! The core takes no singleton: a `Config` is built once by the host, then handed by
//! value (or by `Arc`) to every component at construction. Reconfiguration, if the host
//! supports it, replaces the whole snapshot rather than mutating fields in place (SPEC_FULL
//! §3 "an atomic swap on reconfig; never a mutable global").

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::DiscoveryConfig;
use crate::download::DownloadConfig;
use crate::download::scheduler::SchedulerLimits;
use crate::upload::UploadConfig;

/// Every recognized option from spec.md §6, flattened into one serde-friendly record.
/// Durations are expressed in milliseconds on the wire (TOML/env), matching the `_ms`
/// suffix the spec itself uses for every timing knob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub nickname: String,
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub unicast_port: u16,
    pub beacon_interval_ms: u64,
    pub peer_timeout_ms: u64,
    pub max_udp_datagram_size: usize,
    pub read_buffer_size: usize,
    pub socket_buffer_size: usize,
    pub socket_timeout_ms: u64,
    pub socket_idle_timeout_ms: u64,
    pub upload_lifetime_ms: u64,
    pub max_concurrent_downloads: usize,
    pub max_concurrent_downloads_per_peer: usize,
    pub chunk_request_ack_timeout_ms: u64,
    pub hash_mismatch_cooldown_ms: u64,
    pub scheduling_interval_ms: u64,
    /// Reflected from the File Manager for compatibility only (spec.md §6); the core
    /// never cuts files into chunks itself.
    pub chunk_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        let discovery = DiscoveryConfig::default();
        let upload = UploadConfig::default();
        let download = DownloadConfig::default();
        Self {
            nickname: String::new(),
            multicast_group: discovery.multicast_group,
            multicast_port: discovery.multicast_port,
            unicast_port: discovery.unicast_port,
            beacon_interval_ms: discovery.beacon_interval.as_millis() as u64,
            peer_timeout_ms: crate::peer::DEFAULT_PEER_TIMEOUT.as_millis() as u64,
            max_udp_datagram_size: discovery.max_udp_datagram_size,
            read_buffer_size: upload.read_buffer_size,
            socket_buffer_size: upload.socket_buffer_size,
            socket_timeout_ms: upload.socket_timeout.as_millis() as u64,
            socket_idle_timeout_ms: crate::socket_pool::DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            upload_lifetime_ms: upload.upload_lifetime.as_millis() as u64,
            max_concurrent_downloads: download.limits.max_concurrent_downloads,
            max_concurrent_downloads_per_peer: download.limits.max_concurrent_downloads_per_peer,
            chunk_request_ack_timeout_ms: download.ack_timeout.as_millis() as u64,
            hash_mismatch_cooldown_ms: download.cooldown.as_millis() as u64,
            scheduling_interval_ms: download.scheduling_interval.as_millis() as u64,
            chunk_size: crate::chunk::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    pub fn discovery_config(&self, transfer_listen_port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            multicast_group: self.multicast_group,
            multicast_port: self.multicast_port,
            unicast_port: self.unicast_port,
            beacon_interval: Duration::from_millis(self.beacon_interval_ms),
            max_udp_datagram_size: self.max_udp_datagram_size,
            nickname: self.nickname.clone(),
            transfer_listen_port,
        }
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            read_buffer_size: self.read_buffer_size,
            socket_buffer_size: self.socket_buffer_size,
            socket_timeout: Duration::from_millis(self.socket_timeout_ms),
            upload_lifetime: Duration::from_millis(self.upload_lifetime_ms),
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            limits: SchedulerLimits {
                max_concurrent_downloads: self.max_concurrent_downloads,
                max_concurrent_downloads_per_peer: self.max_concurrent_downloads_per_peer,
            },
            ack_timeout: Duration::from_millis(self.chunk_request_ack_timeout_ms),
            cooldown: Duration::from_millis(self.hash_mismatch_cooldown_ms),
            read_buffer_size: self.read_buffer_size,
            scheduling_interval: Duration::from_millis(self.scheduling_interval_ms),
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn socket_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_idle_timeout_ms)
    }

    /// Validates the handful of options that can be outright wrong rather than merely
    /// unusual (spec.md §7 "Configuration" policy: invalid config is fatal at startup,
    /// rejected-and-ignored at runtime). The host decides which behavior applies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multicast_port == 0 || self.unicast_port == 0 {
            return Err(ConfigError::InvalidEndpoint("port 0 is not bindable"));
        }
        if !self.multicast_group.is_multicast() {
            return Err(ConfigError::InvalidEndpoint("multicast_group is not a multicast address"));
        }
        if self.max_udp_datagram_size == 0 || self.max_udp_datagram_size > crate::wire::MAX_DATAGRAM_BODY {
            return Err(ConfigError::InvalidEndpoint("max_udp_datagram_size out of range"));
        }
        if self.max_concurrent_downloads == 0 || self.max_concurrent_downloads_per_peer == 0 {
            return Err(ConfigError::InvalidEndpoint("concurrency caps must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidEndpoint(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut cfg = Config::default();
        cfg.unicast_port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_multicast_group_is_rejected() {
        let mut cfg = Config::default();
        cfg.multicast_group = Ipv4Addr::new(10, 0, 0, 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sub_configs_reflect_overridden_values() {
        let mut cfg = Config::default();
        cfg.max_concurrent_downloads = 7;
        cfg.read_buffer_size = 4096;
        assert_eq!(cfg.download_config().limits.max_concurrent_downloads, 7);
        assert_eq!(cfg.upload_config().read_buffer_size, 4096);
    }
}
