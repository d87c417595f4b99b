//! Disk-backed write-back cache for remote object stores.
//!
//! The cache sits between a user-visible virtual file system and a remote
//! store that only supports whole-object PUT/GET. It absorbs POSIX-style
//! random reads and writes into per-object backing files, tracks which byte
//! ranges are locally present and which are dirty, and asynchronously
//! reconciles dirty state with the remote through a write-back scheduler.

/// Cache registry, cleaner loop and public entry points.
pub mod cache;
/// Recognized configuration options.
pub mod config;
/// Crate-wide error kinds.
pub mod error;
pub mod io;
/// Per-object cache item state machine.
pub mod item;
/// Sidecar metadata persistence.
pub mod meta;
/// Remote-name canonicalization and on-disk path mapping.
pub mod paths;
/// Coalescing byte-range sets.
pub mod ranges;
/// The remote store interface consumed by the cache.
pub mod remote;
/// Priority-queue upload scheduler.
pub mod writeback;

pub use cache::{AddVirtualFn, Cache, CacheStats};
pub use config::CacheOpt;
pub use error::{Error, Result};
pub use item::{ItemHandle, OpenMode};
pub use ranges::{ByteRange, RangeSet};
pub use remote::{ObjectHash, ObjectInfo, RemoteStore};
