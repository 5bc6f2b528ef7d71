//! Local file cache for remote objects.
//!
//! Remote objects (for example files fetched over HTTP or object storage) are
//! stored as ordinary files in a cache directory that many threads and many
//! processes may share. Each key is populated exactly once, readers never see
//! a partially written file, and an interrupted population never leaves a
//! file behind that a later run would trust.
//!
//! # Cache Location
//!
//! The cache directory is resolved in the following order:
//!
//! 1. `HTTPFS_CACHE_DIR` environment variable if set
//! 2. `$XDG_CACHE_HOME/cached-httpfs/files` if `XDG_CACHE_HOME` is set
//! 3. `~/.cache/cached-httpfs/files` as fallback
//!
//! # Cross-Process Coordination
//!
//! A short-lived directory lock orders the create-or-reuse decision for every
//! key. After that decision, per-file `flock(2)` locks take over: the populator
//! holds an exclusive lock until it finalizes, readers hold shared locks.

mod config;
mod entry;
mod gate;
mod handle;
mod lock;
mod registry;

pub use config::{CACHE_DIR_ENV, FileCacheConfig, resolve_cache_dir};
pub use entry::{CachedFile, MARKER_DIR};
pub use gate::Phase;
pub use handle::CachedFileHandle;
pub use lock::{DirectoryLock, LOCK_FILE_NAME};
pub use registry::FileCacheRegistry;
