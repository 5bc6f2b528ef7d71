//! Domain error types for the remote-file cache.

use color_eyre::Report;
use std::io;
use thiserror::Error;

/// Result alias for operations that may return a [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Result alias for configuration fallible operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level error exposed by the crate.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Indicates the underlying storage could not open, create, resize, lock,
    /// read, or write a file.
    #[error("storage access failed: {context}")]
    Storage {
        /// Operation and path that failed.
        context: String,
        /// Error reported by the filesystem.
        #[source]
        source: io::Error,
    },
    /// Indicates a caller used an entry handle against its phase contract.
    #[error("cache protocol violated: {0}")]
    Protocol(#[from] ProtocolViolation),
    /// Indicates a key cannot name a file inside the cache directory.
    #[error("invalid cache key {key:?}: {reason}")]
    InvalidKey {
        /// Rejected key.
        key: String,
        /// Why the key was rejected.
        reason: &'static str,
    },
    /// Indicates configuration parsing failed.
    #[error("configuration parsing failed")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Returns the protocol violation carried by this error, if any.
    #[must_use]
    pub const fn as_protocol(&self) -> Option<&ProtocolViolation> {
        match self {
            Self::Protocol(violation) => Some(violation),
            _ => None,
        }
    }
}

/// Contract violations against an entry's population/read state machine.
///
/// These are programming errors on the caller's side. The cache reports them
/// instead of silently continuing so the offending operation aborts.
#[derive(Debug, Clone, Copy, Error, Eq, PartialEq)]
pub enum ProtocolViolation {
    /// A write-phase operation was attempted on a finalized entry.
    #[error("cannot {op} an entry that is already initialized")]
    AlreadyInitialized {
        /// Offending operation.
        op: &'static str,
    },
    /// A read was attempted through a handle that is still populating.
    #[error("cannot read an entry while it is being populated")]
    ReadWhilePopulating,
    /// `allocate` was called twice during one population.
    #[error("entry storage was already allocated")]
    AlreadyAllocated,
    /// `grow_file` was asked to shrink the backing storage.
    #[error("capacity may only grow (current {current}, requested {requested})")]
    CapacityShrink {
        /// Capacity before the call.
        current: u64,
        /// Capacity requested by the caller.
        requested: u64,
    },
    /// `grow_file` was asked to retain more bytes than were allocated.
    #[error("cannot retain {retained} bytes of a {capacity}-byte allocation")]
    RetainBeyondCapacity {
        /// Bytes the caller asked to keep.
        retained: u64,
        /// Capacity before the call.
        capacity: u64,
    },
    /// A write would land past the allocated capacity.
    #[error("write of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    WriteBeyondCapacity {
        /// Write offset.
        offset: u64,
        /// Write length.
        len: u64,
        /// Allocated capacity.
        capacity: u64,
    },
    /// `finalize` declared more bytes than were ever allocated.
    #[error("final size {size} exceeds capacity {capacity}")]
    SizeBeyondCapacity {
        /// Declared total size.
        size: u64,
        /// Allocated capacity.
        capacity: u64,
    },
    /// A read would land past the finalized size.
    #[error("read of {len} bytes at offset {offset} exceeds size {size}")]
    ReadBeyondSize {
        /// Read offset.
        offset: u64,
        /// Read length.
        len: u64,
        /// Finalized size.
        size: u64,
    },
}

/// Captures configuration failures.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ConfigError(#[from] Report);

/// Attaches operation context to raw filesystem errors.
pub(crate) trait StorageContext<T> {
    /// Wraps the error as [`CacheError::Storage`] with a lazily built context.
    fn storage_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> StorageContext<T> for io::Result<T> {
    fn storage_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| CacheError::Storage {
            context: context(),
            source,
        })
    }
}
