//! Error kinds surfaced at the cache boundary.
//!
//! Every error carries the canonical remote name of the item it concerns, so
//! callers and logs always know which object a failure belongs to. Local
//! recovery is limited to [`Error::NoSpace`] (back-pressure through the
//! cleaner) and [`Error::Transient`] (upload retries); everything else
//! propagates.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error kinds a cache operation can surface.
#[derive(Debug, Error)]
pub enum Error {
    /// The name has no remote object and no dirty local state.
    #[error("{name:?}: not found")]
    NotFound {
        /// Canonical remote name.
        name: String,
    },

    /// The local disk is full and the cleaner could not free enough space.
    #[error("{name:?}: no space left in cache")]
    NoSpace {
        /// Canonical remote name.
        name: String,
    },

    /// A local file system failure.
    #[error("{name:?}: local io error")]
    Io {
        /// Canonical remote name.
        name: String,
        /// The underlying file system error.
        #[source]
        source: std::io::Error,
    },

    /// A non-transient remote failure.
    #[error("{name:?}: remote error: {message}")]
    Remote {
        /// Canonical remote name.
        name: String,
        /// Adapter-provided description.
        message: String,
    },

    /// A transient remote failure (timeout, 5xx, network).
    #[error("{name:?}: transient remote error: {message}")]
    Transient {
        /// Canonical remote name.
        name: String,
        /// Adapter-provided description.
        message: String,
    },

    /// The operation was aborted by shutdown or an explicit cancel.
    #[error("{name:?}: cancelled")]
    Cancelled {
        /// Canonical remote name.
        name: String,
    },

    /// A sidecar or range list was unreadable.
    #[error("{name:?}: corrupt cache state: {message}")]
    Corrupt {
        /// Canonical remote name.
        name: String,
        /// What failed to parse.
        message: String,
    },

    /// The operation would violate an invariant right now (e.g. resetting an
    /// item with accesses in flight). The cleaner retries these on its next
    /// pass.
    #[error("{name:?}: busy: {message}")]
    Busy {
        /// Canonical remote name.
        name: String,
        /// Which invariant blocked the operation.
        message: String,
    },

    /// The item holds unsynced local writes, so it cannot be evicted or
    /// reset.
    #[error("{name:?}: dirty data present")]
    Dirty {
        /// Canonical remote name.
        name: String,
    },
}

impl Error {
    /// Wrap a local IO error, promoting ENOSPC to [`Error::NoSpace`].
    pub fn io(name: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::StorageFull {
            Self::NoSpace { name: name.into() }
        } else {
            Self::Io {
                name: name.into(),
                source,
            }
        }
    }

    /// Construct a [`Error::NotFound`] for `name`.
    pub fn not_found(name: &str) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Construct a [`Error::Cancelled`] for `name`.
    pub fn cancelled(name: &str) -> Self {
        Self::Cancelled { name: name.into() }
    }

    /// Construct a [`Error::Corrupt`] for `name`.
    pub fn corrupt(name: &str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Construct a [`Error::Busy`] for `name`.
    pub fn busy(name: &str, message: impl Into<String>) -> Self {
        Self::Busy {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True for local-disk-full failures.
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace { .. })
    }

    /// True when the name simply does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the operation was aborted by a cancellation token.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// True when the upload scheduler should retry the failed operation
    /// with backoff. Cancellation is the only failure that is never
    /// retried; everything else (transient or not) gets another attempt
    /// until the retry budget runs out.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !self.is_cancelled()
    }

    /// The canonical remote name this error is attached to.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::NotFound { name }
            | Self::NoSpace { name }
            | Self::Io { name, .. }
            | Self::Remote { name, .. }
            | Self::Transient { name, .. }
            | Self::Cancelled { name }
            | Self::Corrupt { name, .. }
            | Self::Busy { name, .. }
            | Self::Dirty { name } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enospc_maps_to_no_space() {
        let err = Error::io("a/b", std::io::Error::from(std::io::ErrorKind::StorageFull));
        assert!(err.is_no_space(), "StorageFull should map to NoSpace");
        assert_eq!(err.name(), "a/b", "name should be preserved");
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err = Error::io(
            "a/b",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(
            matches!(err, Error::Io { .. }),
            "non-ENOSPC errors should stay Io"
        );
    }

    #[test]
    fn only_cancellation_is_not_retriable() {
        assert!(!Error::cancelled("a").is_retriable());
        let transient = Error::Transient {
            name: "a".into(),
            message: "timeout".into(),
        };
        assert!(transient.is_retriable());
        let remote = Error::Remote {
            name: "a".into(),
            message: "bad gateway".into(),
        };
        assert!(remote.is_retriable());
        assert!(
            Error::io("a", std::io::Error::from(std::io::ErrorKind::PermissionDenied))
                .is_retriable()
        );
    }
}
