//! Makes remote objects available as ordinary local files shared safely
//! between threads and between processes.
//!
//! A caller asks a [`FileCacheRegistry`] for a handle to a key. The registry
//! reuses its in-memory entry, or consults the cache directory under a
//! cross-process lock to reuse a finalized file or create a fresh one. The
//! returned [`CachedFileHandle`] is either the single populator of the entry or
//! a lock-free reader of finalized data.
//!
//! Fetching remote bytes is left to the caller; this crate only stores them.

pub mod cache;
mod error;
mod fs;
mod observability;
pub mod storage;
#[doc(hidden)]
pub mod test_support;

pub use cache::{CachedFile, CachedFileHandle, FileCacheConfig, FileCacheRegistry, Phase};
pub use error::{CacheError, ConfigError, ConfigResult, ProtocolViolation, Result};
pub use storage::{LocalStorage, LockMode, Storage, StorageFile};

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;

/// Captures cache settings supplied via environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, OrthoConfig, Default)]
#[ortho_config(prefix = "HTTPFS")]
///
/// # Examples
/// ```
/// use cached_httpfs::CacheEnvCfg;
///
/// let cfg = CacheEnvCfg::default();
/// assert!(cfg.cache_dir.is_none());
/// ```
pub struct CacheEnvCfg {
    /// Directory holding cached files when provided.
    pub cache_dir: Option<Utf8PathBuf>,
    /// Whether lookup misses create new entries.
    pub enable_cache: Option<bool>,
}

impl CacheEnvCfg {
    /// Loads configuration from environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a variable is present but malformed.
    pub fn load() -> ConfigResult<Self> {
        let args = [OsString::from("cached-httpfs")];
        Self::load_from_iter(args).map_err(|err| ConfigError::from(eyre!(err)))
    }

    /// Converts the environment settings into a cache configuration.
    #[must_use]
    pub fn to_config(&self) -> FileCacheConfig {
        FileCacheConfig::from_env_cfg(self)
    }
}
