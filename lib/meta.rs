//! Sidecar metadata persistence.
//!
//! Each cache item owns one sidecar file in the metadata tree, holding
//! everything needed to resume after a restart: logical size, modification
//! time, hash, present and dirty ranges, upload state and the remote
//! fingerprint. Sidecars are written via temp-file-plus-rename so they are
//! either the old version or the new one, never torn.

use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::io;
use crate::ranges::RangeSet;
use crate::remote::{ObjectHash, ObjectInfo};

/// Highest sidecar schema version this build understands.
pub const SIDECAR_VERSION: u16 = 1;

/// Where an item sits in the upload state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// No unsynced local writes.
    Clean,
    /// Local writes await upload.
    Dirty,
    /// An upload is in flight.
    Uploading,
    /// Uploads exhausted their retries; dirty data stays on disk.
    UploadFailed,
}

/// The `(size, mod_time, hash?)` tuple used to detect remote drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Remote object size.
    pub size: u64,
    /// Remote modification time.
    pub mod_time: DateTime<Utc>,
    /// Remote content hash, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ObjectHash>,
}

impl Fingerprint {
    /// Capture the fingerprint of a remote object.
    #[must_use]
    pub fn of(info: &ObjectInfo) -> Self {
        Self {
            size: info.size,
            mod_time: info.mod_time.into(),
            hash: info.hash.clone(),
        }
    }

    /// Whether the remote object still matches this fingerprint.
    ///
    /// The hash only participates when both sides have one; a remote that
    /// stopped reporting hashes does not count as drift.
    #[must_use]
    pub fn matches(&self, info: &ObjectInfo) -> bool {
        if self.size != info.size || self.mod_time != DateTime::<Utc>::from(info.mod_time) {
            return false;
        }
        match (&self.hash, &info.hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Persistent per-item metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    /// Sidecar schema version.
    pub version: u16,
    /// Logical object size as seen by callers.
    pub size: u64,
    /// Logical modification time.
    pub mod_time: DateTime<Utc>,
    /// Content hash, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ObjectHash>,
    /// Byte ranges downloaded and valid in the backing file.
    #[serde(default)]
    pub present: RangeSet,
    /// Byte ranges written locally and not yet uploaded.
    #[serde(default)]
    pub dirty: RangeSet,
    /// Upload state machine position.
    #[serde(default = "default_state")]
    pub upload_state: UploadState,
    /// Last known remote fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

fn default_state() -> UploadState {
    UploadState::Clean
}

impl ItemMeta {
    /// Fresh metadata for an empty, clean item.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            version: SIDECAR_VERSION,
            size: 0,
            mod_time: Utc::now(),
            hash: None,
            present: RangeSet::new(),
            dirty: RangeSet::new(),
            upload_state: UploadState::Clean,
            fingerprint: None,
        }
    }

    /// Whether the item carries unsynced local writes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.upload_state != UploadState::Clean
    }

    /// The logical modification time as a `SystemTime`.
    #[must_use]
    pub fn mod_time_sys(&self) -> SystemTime {
        self.mod_time.into()
    }
}

/// Outcome of trying to load a sidecar.
#[derive(Debug)]
pub enum SidecarLoad {
    /// The sidecar parsed cleanly.
    Loaded(ItemMeta),
    /// No sidecar file exists.
    Missing,
    /// The sidecar exists but cannot be used: unparseable, or a schema
    /// version newer than this build. Treated as absent (fail-closed); the
    /// caller decides what to do with any backing bytes.
    Unusable(String),
}

/// Load the sidecar at `path`.
///
/// Only real IO failures (not `NotFound`) surface as errors.
pub async fn load(path: &Path) -> std::io::Result<SidecarLoad> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SidecarLoad::Missing),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice::<ItemMeta>(&bytes) {
        Ok(meta) if meta.version > SIDECAR_VERSION => Ok(SidecarLoad::Unusable(format!(
            "sidecar version {} newer than supported {}",
            meta.version, SIDECAR_VERSION
        ))),
        Ok(mut meta) => {
            // An upload cannot survive a restart; the dirty ranges do.
            if meta.upload_state == UploadState::Uploading {
                meta.upload_state = UploadState::Dirty;
            }
            Ok(SidecarLoad::Loaded(meta))
        }
        Err(e) => Ok(SidecarLoad::Unusable(e.to_string())),
    }
}

/// Persist `meta` to `path` with an atomic replace.
///
/// The sidecar's `dirty` list is empty exactly when the upload state is
/// clean. An item can owe the remote an upload with no surviving dirty byte
/// ranges (truncate to zero clips them all), so such states are written
/// with a single zero-length `[0, 0)` marker entry.
pub async fn save(path: &Path, meta: &ItemMeta) -> std::io::Result<()> {
    let mut meta = meta.clone();
    if meta.is_dirty() {
        meta.dirty.mark_empty();
    }
    let bytes = serde_json::to_vec(&meta).map_err(std::io::Error::other)?;
    io::write_file_atomic(path, &bytes).await
}
