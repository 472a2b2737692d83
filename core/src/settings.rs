//! Persisted settings store (spec.md §6 "Persisted state"): opaque named byte blobs
//! under a data directory, written atomically by the write-temp-then-rename idiom.
//!
//! Grounded in `Common::PersistantData` (original_source/application/Common/PersistantData.cpp):
//! the original writes to `name + ".temp"`, then removes any existing `name` and renames the
//! temp file over it. That remove-then-rename is not atomic on every platform (a crash
//! between the two leaves neither file) — SPEC_FULL.md Open Questions resolves this by
//! carrying the same non-atomicity forward rather than pretending it's crash-safe: `rename`
//! alone is atomic where the OS guarantees it (POSIX same-filesystem rename), but we still
//! remove first because some platforms refuse to rename over an existing destination.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings value {0:?} does not exist")]
    NotFound(String),
    #[error("io error persisting {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque named byte blobs under one directory. The core reads at startup and writes on
/// config change; it never interprets the bytes (that's the host's settings schema).
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn temp_path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.temp"))
    }

    /// Write `data` under `name`, via a temp file in the same directory followed by
    /// remove-then-rename (see module docs for why this isn't fully crash-safe).
    pub fn set_value(&self, name: &str, data: &[u8]) -> Result<(), SettingsError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(name, e))?;
        let temp_path = self.temp_path_for(name);
        std::fs::write(&temp_path, data).map_err(|e| io_err(name, e))?;
        let final_path = self.path_for(name);
        if final_path.exists() {
            std::fs::remove_file(&final_path).map_err(|e| io_err(name, e))?;
        }
        std::fs::rename(&temp_path, &final_path).map_err(|e| io_err(name, e))?;
        Ok(())
    }

    pub fn get_value(&self, name: &str) -> Result<Vec<u8>, SettingsError> {
        let path = self.path_for(name);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SettingsError::NotFound(name.to_string())
            } else {
                io_err(name, e)
            }
        })
    }

    /// Returns `false` if the value didn't exist (matches `PersistantData::rmValue`).
    pub fn remove_value(&self, name: &str) -> Result<bool, SettingsError> {
        let path = self.path_for(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(name, e)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn io_err(name: &str, source: std::io::Error) -> SettingsError {
    SettingsError::Io {
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("meshcast-settings-test-{}", std::process::id()));
        dir.push(uuid_like());
        dir
    }

    // No uuid dependency in this crate; a counter plus the PID is unique enough for
    // parallel test runs within one process.
    fn uuid_like() -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn round_trips_a_value() {
        let store = SettingsStore::new(temp_dir());
        store.set_value("config.bin", b"hello").unwrap();
        assert_eq!(store.get_value("config.bin").unwrap(), b"hello");
    }

    #[test]
    fn missing_value_is_not_found() {
        let store = SettingsStore::new(temp_dir());
        assert!(matches!(store.get_value("nope"), Err(SettingsError::NotFound(_))));
    }

    #[test]
    fn overwrite_replaces_prior_value() {
        let store = SettingsStore::new(temp_dir());
        store.set_value("a", b"first").unwrap();
        store.set_value("a", b"second").unwrap();
        assert_eq!(store.get_value("a").unwrap(), b"second");
    }

    #[test]
    fn remove_reports_whether_it_existed() {
        let store = SettingsStore::new(temp_dir());
        assert!(!store.remove_value("x").unwrap());
        store.set_value("x", b"y").unwrap();
        assert!(store.remove_value("x").unwrap());
        assert!(!store.remove_value("x").unwrap());
    }
}
