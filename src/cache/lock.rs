//! Cross-process directory lock for cache entry creation.
//!
//! Serialises the "does a finalized file exist, and if not, create it"
//! decision across every process sharing a cache directory. The lock is held
//! only for that decision, never while an entry is being populated.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::error::{Result, StorageContext};
use crate::observability::STORAGE_TARGET;
use crate::storage::{LockMode, Storage, StorageFile};

/// Name of the coordination file inside a cache directory.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Guard that holds the directory lock until dropped.
///
/// The lock file carries no data and is never removed; it only exists so
/// every process has the same inode to lock.
#[derive(Debug)]
pub struct DirectoryLock {
    _file: Box<dyn StorageFile>,
    path: Utf8PathBuf,
}

impl DirectoryLock {
    /// Acquires the exclusive lock for `cache_dir`, blocking until it is free.
    ///
    /// The first process to reach an empty directory creates the lock file
    /// exclusively; later callers open the existing file and wait for the
    /// lock. There is no timeout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CacheError::Storage`] if the lock file cannot be
    /// created, opened, or locked.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use camino::Utf8Path;
    /// use cached_httpfs::LocalStorage;
    /// use cached_httpfs::cache::DirectoryLock;
    ///
    /// let lock = DirectoryLock::acquire(&LocalStorage::new(), Utf8Path::new("/tmp/httpfs"))?;
    /// // Only this process may decide which entries exist right now.
    /// lock.release();
    /// # Ok::<(), cached_httpfs::CacheError>(())
    /// ```
    pub fn acquire(storage: &dyn Storage, cache_dir: &Utf8Path) -> Result<Self> {
        let path = cache_dir.join(LOCK_FILE_NAME);

        let created = storage
            .create_new(&path)
            .storage_context(|| format!("create directory lock {path}"))?;
        let file = match created {
            Some(file) => file,
            None => storage
                .open_write(&path)
                .storage_context(|| format!("open directory lock {path}"))?,
        };

        file.lock(LockMode::Exclusive)
            .storage_context(|| format!("lock directory {cache_dir}"))?;

        debug!(target: STORAGE_TARGET, path = %path, "directory lock acquired");
        Ok(Self { _file: file, path })
    }

    /// Returns the path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Closes the lock file, releasing the lock.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        debug!(target: STORAGE_TARGET, path = %self.path, "directory lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::storage::{LocalStorage, MockStorage};
    use std::io;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_lock_file() {
        let temp = tempdir().expect("tempdir");
        let cache_dir = Utf8Path::from_path(temp.path()).expect("utf8 path");

        let lock = DirectoryLock::acquire(&LocalStorage::new(), cache_dir).expect("acquire");

        assert_eq!(lock.path(), cache_dir.join(LOCK_FILE_NAME));
        assert!(cache_dir.join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn acquire_reuses_existing_lock_file() {
        let temp = tempdir().expect("tempdir");
        let cache_dir = Utf8Path::from_path(temp.path()).expect("utf8 path");

        DirectoryLock::acquire(&LocalStorage::new(), cache_dir)
            .expect("first acquire")
            .release();
        DirectoryLock::acquire(&LocalStorage::new(), cache_dir)
            .expect("second acquire")
            .release();

        assert!(cache_dir.join(LOCK_FILE_NAME).exists());
    }

    #[cfg(unix)]
    #[test]
    fn second_acquirer_waits_for_release() {
        let temp = tempdir().expect("tempdir");
        let cache_dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
        let held = DirectoryLock::acquire(&LocalStorage::new(), &cache_dir).expect("acquire");

        let (tx, rx) = mpsc::channel();
        let waiter_dir = cache_dir.clone();
        let waiter = thread::spawn(move || {
            let lock = DirectoryLock::acquire(&LocalStorage::new(), &waiter_dir).expect("acquire");
            tx.send(()).expect("signal");
            lock.release();
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "second acquirer must block while the lock is held"
        );
        held.release();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("second acquirer should proceed after release");
        waiter.join().expect("waiter joins");
    }

    #[test]
    fn missing_directory_is_a_storage_error() {
        let temp = tempdir().expect("tempdir");
        let cache_dir = Utf8Path::from_path(temp.path())
            .expect("utf8 path")
            .join("does/not/exist");

        let err = DirectoryLock::acquire(&LocalStorage::new(), &cache_dir).expect_err("fails");
        assert!(matches!(err, CacheError::Storage { .. }));
    }

    #[test]
    fn open_failure_after_lost_create_race_propagates() {
        let mut storage = MockStorage::new();
        storage.expect_create_new().returning(|_| Ok(None));
        storage
            .expect_open_write()
            .returning(|_| Err(io::Error::from(io::ErrorKind::PermissionDenied)));

        let err = DirectoryLock::acquire(&storage, Utf8Path::new("/cache")).expect_err("fails");
        match err {
            CacheError::Storage { context, source } => {
                assert_eq!(context, "open directory lock /cache/.lock");
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("expected storage error, got {other:?}"),
        }
    }
}
