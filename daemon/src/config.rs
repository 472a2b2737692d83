//! Load daemon configuration from file and environment (SPEC_FULL.md §3 "Configuration").
//!
//! Host-only knobs (ports the core doesn't know about, shared/download directories) live
//! alongside a nested `[core]` table that deserializes straight into `meshcast_core::Config`.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration. File: `~/.config/meshcast/config.toml` or `/etc/meshcast/config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    /// TCP port the Socket Pool listens on for transfer connections.
    pub transfer_port: u16,
    /// Directory for `SettingsStore` persisted state.
    pub data_dir: PathBuf,
    /// Directories scanned at startup and offered to peers.
    pub shared_dirs: Vec<PathBuf>,
    /// Destination directory for files fetched from peers.
    pub downloads_dir: PathBuf,
    pub core: meshcast_core::Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            transfer_port: 45680,
            data_dir: default_data_dir(),
            shared_dirs: Vec::new(),
            downloads_dir: default_data_dir().join("downloads"),
            core: meshcast_core::Config::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local/share/meshcast")
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> DaemonConfig {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c);
    c
}

fn apply_env(c: &mut DaemonConfig) {
    if let Ok(v) = std::env::var("MESHCAST_NICKNAME") {
        c.core.nickname = v;
    }
    if let Some(p) = env_port("MESHCAST_MULTICAST_PORT") {
        c.core.multicast_port = p;
    }
    if let Some(p) = env_port("MESHCAST_UNICAST_PORT") {
        c.core.unicast_port = p;
    }
    if let Some(p) = env_port("MESHCAST_TRANSFER_PORT") {
        c.transfer_port = p;
    }
    if let Ok(v) = std::env::var("MESHCAST_MULTICAST_GROUP") {
        if let Ok(addr) = v.parse::<Ipv4Addr>() {
            c.core.multicast_group = addr;
        }
    }
    if let Ok(v) = std::env::var("MESHCAST_DATA_DIR") {
        c.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MESHCAST_DOWNLOADS_DIR") {
        c.downloads_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MESHCAST_SHARED_DIRS") {
        c.shared_dirs = std::env::split_paths(&v).collect();
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshcast/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshcast/config.toml"));
    out
}

fn load_file() -> Option<DaemonConfig> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<DaemonConfig>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => {
                        tracing::warn!(path = %p.display(), error = %e, "daemon: failed to parse config file, using defaults");
                    }
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DaemonConfig::default().core.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("MESHCAST_NICKNAME", "test-host");
        std::env::set_var("MESHCAST_TRANSFER_PORT", "9999");
        let mut c = DaemonConfig::default();
        apply_env(&mut c);
        assert_eq!(c.core.nickname, "test-host");
        assert_eq!(c.transfer_port, 9999);
        std::env::remove_var("MESHCAST_NICKNAME");
        std::env::remove_var("MESHCAST_TRANSFER_PORT");
    }
}
