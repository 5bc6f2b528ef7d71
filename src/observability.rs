//! Shared tracing configuration for observability instrumentation.
//!
//! Centralises the log targets used by the crate so subscribers can filter
//! cache events without pulling in unrelated application logs.

/// Target used by registry, entry, and handle events.
pub(crate) const CACHE_TARGET: &str = "cached_httpfs::cache";

/// Target used by directory locking and file cleanup events.
pub(crate) const STORAGE_TARGET: &str = "cached_httpfs::storage";
