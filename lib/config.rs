//! Recognized cache configuration options.
//!
//! Config *parsing* belongs to the frontends; they deserialize this struct
//! straight out of their own config files (every field has a serde default).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options controlling the cache engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOpt {
    /// Base directory under which the `vfs` and `vfsMeta` trees live.
    pub cache_dir: PathBuf,

    /// Quota in bytes for eviction. Zero or negative means unlimited.
    pub max_size: i64,

    /// Age after which an unused clean item is purged.
    pub max_age: Duration,

    /// How often the cleaner runs. Zero disables periodic cleaning.
    pub poll_interval: Duration,

    /// Delay from the last write until an item becomes eligible for upload.
    pub write_back_delay: Duration,

    /// Maximum number of uploads in flight at once.
    pub max_upload_concurrency: usize,

    /// How many times a failed upload is retried before the item is parked
    /// in the failed state.
    pub max_retries: u32,

    /// First retry delay; doubled on every subsequent failure.
    pub base_backoff: Duration,

    /// Upper bound on the retry delay.
    pub max_backoff: Duration,

    /// How long shutdown waits for in-flight uploads to drain.
    pub drain_timeout: Duration,

    /// How long cached metadata is trusted before the remote is re-statted
    /// on open.
    pub validate_window: Duration,
}

impl Default for CacheOpt {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("vfs-cache"),
            max_size: -1,
            max_age: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(60),
            write_back_delay: Duration::from_secs(5),
            max_upload_concurrency: 4,
            max_retries: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            validate_window: Duration::from_secs(5),
        }
    }
}

impl CacheOpt {
    /// The eviction quota, or `None` when the cache size is unlimited.
    #[must_use]
    pub fn quota(&self) -> Option<u64> {
        u64::try_from(self.max_size).ok().filter(|&q| q > 0)
    }
}
