//! The remote object store interface consumed by the cache.
//!
//! Protocol adapters implement [`RemoteStore`] for their backend. The cache
//! only ever moves whole objects upward (PUT) and byte ranges downward (GET);
//! everything else the adapter does (connection pooling, request timeouts,
//! backend-specific rename emulation) is invisible here.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ranges::ByteRange;

/// A content hash as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHash {
    /// Algorithm name, e.g. `"md5"` or `"sha256"`.
    pub algo: String,
    /// Lower-case hex digest.
    pub hex: String,
}

/// What the remote knows about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object size in bytes.
    pub size: u64,
    /// Remote modification time.
    pub mod_time: SystemTime,
    /// Content hash, if the remote provides one.
    pub hash: Option<ObjectHash>,
}

/// Operations the cache needs from a remote adapter.
///
/// All calls must honor the cancellation token and surface distinguishable
/// [`Error::NotFound`](crate::Error::NotFound) and
/// [`Error::NoSpace`](crate::Error::NoSpace) kinds; transient failures
/// (timeouts, 5xx) should come back as
/// [`Error::Transient`](crate::Error::Transient) so the scheduler retries
/// them.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// A stable identifier for this remote (used in the on-disk cache
    /// layout), e.g. `"s3:bucket/prefix"`.
    fn id(&self) -> String;

    /// Upload a whole object, reading `info.size` bytes from `src`.
    ///
    /// Returns the object info as observed by the remote after the upload,
    /// which becomes the item's new fingerprint.
    async fn put(
        &self,
        name: &str,
        src: tokio::fs::File,
        info: &ObjectInfo,
        token: &CancellationToken,
    ) -> Result<ObjectInfo>;

    /// Download one byte range of an object.
    async fn get_range(
        &self,
        name: &str,
        range: ByteRange,
        token: &CancellationToken,
    ) -> Result<Bytes>;

    /// Stat a single object.
    async fn stat(&self, name: &str, token: &CancellationToken) -> Result<ObjectInfo>;

    /// Delete an object. Deleting a missing object surfaces `NotFound`.
    async fn delete(&self, name: &str, token: &CancellationToken) -> Result<()>;

    /// Server-side move of `src` to `dst`.
    async fn rename(&self, src: &str, dst: &str, token: &CancellationToken) -> Result<()>;

    /// Hash algorithm names this remote can produce.
    fn supported_hashes(&self) -> Vec<String>;
}
