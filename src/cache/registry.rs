//! Process-wide lookup and creation point for cache entries.
//!
//! The registry keeps one shared [`CachedFile`] per backing path so threads in
//! this process never race each other on the filesystem for the same key.
//! Other processes have their own registries; the
//! [`DirectoryLock`](super::DirectoryLock) is what orders them.

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::debug;

use super::config::FileCacheConfig;
use super::entry::{CachedFile, validate_key};
use super::gate::Phase;
use super::handle::CachedFileHandle;
use crate::error::{Result, StorageContext};
use crate::observability::CACHE_TARGET;
use crate::storage::{LocalStorage, Storage};

/// Maps cache keys to shared entries.
///
/// Construct one per process or per session and tear it down with
/// [`clear`](Self::clear) or by dropping it. Independent registries are fully
/// isolated in memory, which is how tests model separate processes.
#[derive(Debug)]
pub struct FileCacheRegistry {
    storage: Arc<dyn Storage>,
    entries: DashMap<Utf8PathBuf, Arc<CachedFile>>,
}

impl Default for FileCacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCacheRegistry {
    /// Creates a registry over the local filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::with_storage(Arc::new(LocalStorage::new()))
    }

    /// Creates a registry over custom storage.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
        }
    }

    /// Returns a handle to the entry for `key` in `cache_dir`.
    ///
    /// On a registry hit no filesystem access happens. On a miss the entry is
    /// opened under the directory lock: a finalized file is reused, otherwise a
    /// new file is created when `allow_create` is true. `Ok(None)` means the
    /// key is not cached and creation was not requested; nothing is recorded,
    /// so a later call with `allow_create` can still create it.
    ///
    /// The returned handle is populating if the entry still needs data. If
    /// another handle is populating the entry, this call blocks until that
    /// handle finalizes (the new handle reads) or is dropped (the lookup starts
    /// over and may populate a fresh entry).
    ///
    /// # Errors
    ///
    /// Returns [`crate::CacheError::InvalidKey`] for keys that are not plain
    /// file names, and [`crate::CacheError::Storage`] if the cache directory,
    /// lock file, or entry file cannot be created or opened.
    pub fn get_entry(
        &self,
        cache_dir: &Utf8Path,
        key: &str,
        allow_create: bool,
    ) -> Result<Option<CachedFileHandle>> {
        loop {
            let Some(file) = self.get_cached_file(cache_dir, key, allow_create)? else {
                return Ok(None);
            };
            if let Some(handle) = CachedFileHandle::admit(file) {
                return Ok(Some(handle));
            }
            debug!(target: CACHE_TARGET, key, "entry abandoned while waiting; retrying");
        }
    }

    /// Returns a handle using the directory and creation policy of `config`.
    ///
    /// # Errors
    ///
    /// See [`get_entry`](Self::get_entry).
    pub fn get_entry_with_config(
        &self,
        config: &FileCacheConfig,
        key: &str,
    ) -> Result<Option<CachedFileHandle>> {
        self.get_entry(&config.cache_dir, key, config.enable_cache)
    }

    /// Returns the shared entry for `key` without taking a handle.
    ///
    /// Abandoned entries are never returned; they are evicted and the key is
    /// opened again. The map is not locked while the entry is opened, so a
    /// slow population of one key never stalls lookups of another.
    ///
    /// # Errors
    ///
    /// See [`get_entry`](Self::get_entry).
    pub fn get_cached_file(
        &self,
        cache_dir: &Utf8Path,
        key: &str,
        allow_create: bool,
    ) -> Result<Option<Arc<CachedFile>>> {
        validate_key(key)?;
        let path = cache_dir.join(key);

        if let Some(found) = self.live_entry(&path) {
            debug!(target: CACHE_TARGET, key, "registry hit");
            return Ok(Some(found));
        }

        debug!(target: CACHE_TARGET, key, dir = %cache_dir, "registry miss");
        self.storage
            .create_dir_all(cache_dir)
            .storage_context(|| format!("create cache directory {cache_dir}"))?;
        let Some(file) = CachedFile::open(Arc::clone(&self.storage), cache_dir, key, allow_create)?
        else {
            return Ok(None);
        };
        Ok(Some(self.publish(path, Arc::new(file))))
    }

    /// Returns the registered entry for `path` unless it was abandoned, in
    /// which case it is evicted.
    fn live_entry(&self, path: &Utf8Path) -> Option<Arc<CachedFile>> {
        let found = self.entries.get(path).map(|entry| Arc::clone(entry.value()))?;
        if found.phase() != Phase::Abandoned {
            return Some(found);
        }
        self.entries
            .remove_if(path, |_, current| Arc::ptr_eq(current, &found));
        None
    }

    /// Inserts `opened` unless another thread registered a live entry for the
    /// same path first, in which case that entry wins and `opened` is dropped
    /// outside the map lock.
    fn publish(&self, path: Utf8PathBuf, opened: Arc<CachedFile>) -> Arc<CachedFile> {
        let (winner, displaced) = match self.entries.entry(path) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&opened));
                (opened, None)
            }
            Entry::Occupied(mut slot) if slot.get().phase() == Phase::Abandoned => {
                let previous = slot.insert(Arc::clone(&opened));
                (opened, Some(previous))
            }
            Entry::Occupied(slot) => (Arc::clone(slot.get()), Some(opened)),
        };
        drop(displaced);
        winner
    }

    /// Returns `true` if the registry holds an entry for `key`.
    #[must_use]
    pub fn contains(&self, cache_dir: &Utf8Path, key: &str) -> bool {
        self.entries.contains_key(&cache_dir.join(key))
    }

    /// Returns the number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the registry's references to every entry.
    ///
    /// Entries still referenced by handles stay alive until those handles are
    /// dropped; unfinalized entries remove their files once the last
    /// reference goes away.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::storage::MockStorage;
    use std::io;
    use tempfile::{TempDir, tempdir};

    fn scratch() -> (TempDir, Utf8PathBuf) {
        let temp = tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
        (temp, root)
    }

    #[test]
    fn miss_without_create_records_nothing() {
        let (_temp, root) = scratch();
        let registry = FileCacheRegistry::new();

        let handle = registry.get_entry(&root, "object2", false).expect("lookup");
        assert!(handle.is_none());
        assert!(registry.is_empty());

        let handle = registry
            .get_entry(&root, "object2", true)
            .expect("lookup")
            .expect("created");
        assert!(handle.is_populating());
        assert!(registry.contains(&root, "object2"));
    }

    #[test]
    fn hit_returns_the_same_entry() {
        let (_temp, root) = scratch();
        let registry = FileCacheRegistry::new();

        let first = registry
            .get_cached_file(&root, "object1", true)
            .expect("lookup")
            .expect("created");
        let second = registry
            .get_cached_file(&root, "object1", false)
            .expect("lookup")
            .expect("hit");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn creates_missing_cache_directory() {
        let (_temp, root) = scratch();
        let nested = root.join("deep/cache");
        let registry = FileCacheRegistry::new();

        let handle = registry
            .get_entry(&nested, "object1", true)
            .expect("lookup")
            .expect("created");
        assert!(nested.join("object1").exists());
        drop(handle);
    }

    #[test]
    fn invalid_key_is_rejected_before_touching_storage() {
        let registry = FileCacheRegistry::with_storage(Arc::new(MockStorage::new()));

        let err = registry
            .get_entry(Utf8Path::new("/cache"), "../escape", true)
            .expect_err("invalid");
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[test]
    fn directory_creation_failure_is_reported() {
        let mut storage = MockStorage::new();
        storage
            .expect_create_dir_all()
            .returning(|_| Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        let registry = FileCacheRegistry::with_storage(Arc::new(storage));

        let err = registry
            .get_entry(Utf8Path::new("/cache"), "object1", true)
            .expect_err("fails");
        match err {
            CacheError::Storage { context, source } => {
                assert_eq!(context, "create cache directory /cache");
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("expected storage error, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn clear_removes_unfinalized_files() {
        let (_temp, root) = scratch();
        let registry = FileCacheRegistry::new();
        let entry = registry
            .get_cached_file(&root, "object1", true)
            .expect("lookup")
            .expect("created");
        drop(entry);
        assert!(root.join("object1").exists());

        registry.clear();

        assert!(registry.is_empty());
        assert!(!root.join("object1").exists());
    }

    #[test]
    fn abandoned_entry_is_replaced_on_next_lookup() {
        let (_temp, root) = scratch();
        let registry = FileCacheRegistry::new();
        let abandoned = registry
            .get_entry(&root, "object1", true)
            .expect("lookup")
            .expect("created");
        let retired = Arc::clone(abandoned.entry());
        drop(abandoned);
        assert_eq!(retired.phase(), Phase::Abandoned);
        assert!(!root.join("object1").exists());

        assert!(
            registry
                .get_entry(&root, "object1", false)
                .expect("lookup")
                .is_none()
        );
        assert!(!registry.contains(&root, "object1"));

        let fresh = registry
            .get_entry(&root, "object1", true)
            .expect("lookup")
            .expect("created");
        assert!(fresh.is_populating());
        assert!(!Arc::ptr_eq(fresh.entry(), &retired));
        assert!(registry.contains(&root, "object1"));
    }
}
