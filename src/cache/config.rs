//! Configuration for the remote-file cache.
//!
//! Resolves the cache directory from environment variables with XDG-compliant
//! fallback paths.

use camino::Utf8PathBuf;
use std::path::PathBuf;

use crate::CacheEnvCfg;

/// Subdirectory path within the XDG cache home.
const CACHE_SUBDIR: &str = "cached-httpfs/files";

/// Environment variable that overrides the cache directory.
pub const CACHE_DIR_ENV: &str = "HTTPFS_CACHE_DIR";

/// Configuration for the remote-file cache.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileCacheConfig {
    /// Directory holding cached files and the directory lock.
    pub cache_dir: Utf8PathBuf,
    /// Whether a lookup miss creates a new entry for population.
    pub enable_cache: bool,
}

impl FileCacheConfig {
    /// Creates a cache configuration using the resolved cache directory with
    /// entry creation enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dir(resolve_cache_dir())
    }

    /// Creates a cache configuration with a custom directory.
    #[must_use]
    pub const fn with_dir(cache_dir: Utf8PathBuf) -> Self {
        Self {
            cache_dir,
            enable_cache: true,
        }
    }

    /// Builds the configuration from loaded environment settings, filling
    /// gaps with the resolved defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// use cached_httpfs::CacheEnvCfg;
    /// use cached_httpfs::cache::FileCacheConfig;
    ///
    /// let cfg = CacheEnvCfg {
    ///     cache_dir: Some("/srv/httpfs".into()),
    ///     enable_cache: Some(false),
    /// };
    /// let config = FileCacheConfig::from_env_cfg(&cfg);
    /// assert_eq!(config.cache_dir.as_str(), "/srv/httpfs");
    /// assert!(!config.enable_cache);
    /// ```
    #[must_use]
    pub fn from_env_cfg(cfg: &CacheEnvCfg) -> Self {
        Self {
            cache_dir: cfg.cache_dir.clone().unwrap_or_else(resolve_cache_dir),
            enable_cache: cfg.enable_cache.unwrap_or(true),
        }
    }
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the cache directory from environment and XDG conventions.
///
/// The resolution order is:
///
/// 1. `HTTPFS_CACHE_DIR` environment variable if set and valid UTF-8
/// 2. `$XDG_CACHE_HOME/cached-httpfs/files` if `XDG_CACHE_HOME` is set
/// 3. `~/.cache/cached-httpfs/files` as fallback
/// 4. `/tmp/cached-httpfs/files` as last resort
///
/// # Examples
///
/// ```
/// use cached_httpfs::cache::resolve_cache_dir;
///
/// let cache_dir = resolve_cache_dir();
/// assert!(!cache_dir.as_str().is_empty());
/// ```
#[must_use]
pub fn resolve_cache_dir() -> Utf8PathBuf {
    resolve_from_env()
        .or_else(resolve_from_xdg_cache)
        .or_else(resolve_from_home)
        .unwrap_or_else(|| Utf8PathBuf::from("/tmp").join(CACHE_SUBDIR))
}

fn non_empty_var(name: &str) -> Option<Utf8PathBuf> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Utf8PathBuf::from_path_buf(PathBuf::from(trimmed)).ok()
}

fn resolve_from_env() -> Option<Utf8PathBuf> {
    non_empty_var(CACHE_DIR_ENV)
}

fn resolve_from_xdg_cache() -> Option<Utf8PathBuf> {
    non_empty_var("XDG_CACHE_HOME").map(|path| path.join(CACHE_SUBDIR))
}

fn resolve_from_home() -> Option<Utf8PathBuf> {
    let home = dirs::home_dir()?;
    let path = Utf8PathBuf::from_path_buf(home).ok()?;
    Some(path.join(".cache").join(CACHE_SUBDIR))
}
