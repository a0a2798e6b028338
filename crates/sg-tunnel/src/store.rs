//! Tunnel Store
//!
//! Durable single-slot record of the server configuration that should be
//! running, plus the last reported status. The provider process may be
//! killed and relaunched by the OS at any time; the record lets the next
//! instance resume the session without losing the user's intent.
//!
//! Writes go to a temp file that is synced and renamed over the record, so
//! a reader always sees either the previous or the new record.

use crate::config::ServerConfiguration;
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Persisted record layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    /// Configuration that should be active
    #[serde(default)]
    pub configuration: Option<ServerConfiguration>,
    /// Last status written by the controller
    #[serde(default)]
    pub last_status: Status,
    /// Did the last relay report UDP support?
    #[serde(default)]
    pub udp_supported: bool,
}

/// Storage-layer failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

enum Backend {
    File(PathBuf),
    Memory(StoreRecord),
}

/// Durable store for the active tunnel configuration
pub struct TunnelStore {
    backend: Mutex<Backend>,
}

impl TunnelStore {
    /// File-backed store. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: Mutex::new(Backend::File(path.into())),
        }
    }

    /// Process-local store
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(StoreRecord::default())),
        }
    }

    /// Replace the stored configuration
    pub fn save(&self, config: &ServerConfiguration) -> Result<(), StoreError> {
        self.update(|record| record.configuration = Some(config.clone()))
    }

    /// Replace configuration and status in one write
    pub fn save_session(&self, config: &ServerConfiguration, status: Status) -> Result<(), StoreError> {
        self.update(|record| {
            record.configuration = Some(config.clone());
            record.last_status = status;
        })
    }

    /// Last saved configuration
    pub fn load(&self) -> Option<ServerConfiguration> {
        match self.read() {
            Ok(record) => record.configuration,
            Err(e) => {
                warn!("Tunnel store unreadable, treating as empty: {}", e);
                None
            }
        }
    }

    /// Remove the stored configuration
    pub fn clear(&self) -> Result<(), StoreError> {
        self.update(|record| record.configuration = None)
    }

    /// Last status written by the controller
    pub fn last_status(&self) -> Status {
        self.read().map(|r| r.last_status).unwrap_or_default()
    }

    /// Persist the last status
    pub fn set_last_status(&self, status: Status) -> Result<(), StoreError> {
        self.update(|record| record.last_status = status)
    }

    /// Did the relay report UDP support?
    pub fn is_udp_supported(&self) -> bool {
        self.read().map(|r| r.udp_supported).unwrap_or(false)
    }

    /// Persist the relay's UDP support
    pub fn set_udp_supported(&self, supported: bool) -> Result<(), StoreError> {
        self.update(|record| record.udp_supported = supported)
    }

    /// Whole record
    pub fn record(&self) -> Result<StoreRecord, StoreError> {
        self.read()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Result<StoreRecord, StoreError> {
        match &*self.lock() {
            Backend::File(path) => read_record(path),
            Backend::Memory(record) => Ok(record.clone()),
        }
    }

    fn update(&self, change: impl FnOnce(&mut StoreRecord)) -> Result<(), StoreError> {
        let mut backend = self.lock();
        match &mut *backend {
            Backend::File(path) => {
                let mut record = read_record(path).unwrap_or_else(|e| {
                    warn!("Overwriting unreadable tunnel store {}: {}", path.display(), e);
                    StoreRecord::default()
                });
                change(&mut record);
                write_record(path, &record)
            }
            Backend::Memory(record) => {
                change(record);
                Ok(())
            }
        }
    }
}

fn read_record(path: &Path) -> Result<StoreRecord, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreRecord::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_record(path: &Path, record: &StoreRecord) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_vec_pretty(record)?;
    let temp_path = path.with_extension("tmp");

    // Write to temp file first (atomic write pattern)
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;

    debug!("Tunnel store written to {} ({} bytes)", path.display(), data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use crate::error::ErrorCode;

    fn sample() -> ServerConfiguration {
        ServerConfiguration::new("203.0.113.7", 8388, Method::Chacha20IetfPoly1305, "secret")
            .with_id("tunnel-1")
    }

    #[test]
    fn test_round_trip_in_memory() {
        let store = TunnelStore::in_memory();
        assert_eq!(store.load(), None);

        store.save(&sample()).unwrap();
        assert_eq!(store.load(), Some(sample()));

        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let store = TunnelStore::open(&path);

        assert_eq!(store.load(), None);
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), Some(sample()));
        assert!(!path.with_extension("tmp").exists());

        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = TunnelStore::open(&path);
            store.save_session(&sample(), Status::connected()).unwrap();
            store.set_udp_supported(true).unwrap();
        }

        let reopened = TunnelStore::open(&path);
        assert_eq!(reopened.load(), Some(sample()));
        assert_eq!(reopened.last_status(), Status::connected());
        assert!(reopened.is_udp_supported());
    }

    #[test]
    fn test_clear_keeps_status() {
        let store = TunnelStore::in_memory();
        store.save(&sample()).unwrap();
        store.set_last_status(Status::invalid(ErrorCode::ServerUnreachable)).unwrap();
        store.clear().unwrap();

        let record = store.record().unwrap();
        assert_eq!(record.configuration, None);
        assert_eq!(record.last_status.error, Some(ErrorCode::ServerUnreachable));
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, b"{ truncated").unwrap();

        let store = TunnelStore::open(&path);
        assert_eq!(store.load(), None);
        assert!(matches!(store.record(), Err(StoreError::Serialization(_))));

        // A save replaces the corrupt record
        store.save(&sample()).unwrap();
        assert_eq!(store.load(), Some(sample()));
    }

    #[test]
    fn test_write_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        // The record path is an existing directory, so the rename must fail
        let path = dir.path().join("occupied");
        fs::create_dir_all(path.join("child")).unwrap();

        let store = TunnelStore::open(&path);
        assert!(matches!(store.save(&sample()), Err(StoreError::Io(_))));
    }
}
