//! Underlying storage access used by the cache.
//!
//! The cache never touches `std::fs` directly; it goes through [`Storage`] so
//! the filesystem can be swapped (for example with a mock in tests, or a
//! FUSE-backed object store mount with different locking semantics).
//!
//! Files are addressed with positional I/O only. Callers pre-size a file with
//! [`StorageFile::trim`] and then fill arbitrary byte ranges, so population
//! does not need to be sequential.

mod local;

pub use local::LocalStorage;

use camino::Utf8Path;
use std::fmt;
use std::io;

/// Advisory lock modes understood by [`StorageFile::lock`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LockMode {
    /// Shared lock held by readers of a finalized file.
    Shared,
    /// Exclusive lock held by the single writer of a file.
    Exclusive,
}

/// An open file handle with positional I/O and advisory locking.
///
/// Dropping the handle closes it and releases any lock it holds.
pub trait StorageFile: Send + Sync + fmt::Debug {
    /// Blocks until the lock is held in the requested mode.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the lock call fails.
    fn lock(&self, mode: LockMode) -> io::Result<()>;

    /// Attempts to take the lock without blocking.
    ///
    /// Returns `Ok(false)` when another holder prevents acquisition.
    ///
    /// # Errors
    ///
    /// Returns the OS error for failures other than contention.
    fn try_lock(&self, mode: LockMode) -> io::Result<bool>;

    /// Fills `buf` from the file starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be read in full.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Writes all of `buf` into the file starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be written in full.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Resizes the file to `len` bytes, keeping the first `retain` bytes and
    /// zeroing everything after them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized.
    fn trim(&self, retain: u64, len: u64) -> io::Result<()>;

    /// Returns the current length of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    fn size(&self) -> io::Result<u64>;

    /// Flushes file contents to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn sync(&self) -> io::Result<()>;
}

/// Filesystem operations consumed by the cache.
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Opens an existing file read-only, returning `None` if it is absent.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than the file being absent.
    fn open_read(&self, path: &Utf8Path) -> io::Result<Option<Box<dyn StorageFile>>>;

    /// Creates a file for reading and writing, returning `None` if it already
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than the file already existing.
    fn create_new(&self, path: &Utf8Path) -> io::Result<Option<Box<dyn StorageFile>>>;

    /// Opens a file for reading and writing, creating it when missing.
    /// Existing contents are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    fn open_write(&self, path: &Utf8Path) -> io::Result<Box<dyn StorageFile>>;

    /// Removes a file. Removing an absent file succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, path: &Utf8Path) -> io::Result<()>;

    /// Creates a directory and any missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()>;
}
