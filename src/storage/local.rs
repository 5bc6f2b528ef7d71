//! [`Storage`] backed by the local filesystem.
//!
//! On Unix systems advisory locks use `flock(2)`, which is released by the
//! kernel when the owning process exits. On non-Unix platforms locking is a
//! no-op and cross-process coordination is not provided.

use camino::Utf8Path;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use super::{LockMode, Storage, StorageFile};
use crate::fs::ensure_dir_exists;

/// Local filesystem storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorage;

impl LocalStorage {
    /// Creates a local storage accessor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Storage for LocalStorage {
    fn open_read(&self, path: &Utf8Path) -> io::Result<Option<Box<dyn StorageFile>>> {
        match File::open(path) {
            Ok(file) => Ok(Some(Box::new(LocalFile { file }))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_new(&self, path: &Utf8Path) -> io::Result<Option<Box<dyn StorageFile>>> {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => Ok(Some(Box::new(LocalFile { file }))),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn open_write(&self, path: &Utf8Path) -> io::Result<Box<dyn StorageFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Box::new(LocalFile { file }))
    }

    fn remove(&self, path: &Utf8Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        ensure_dir_exists(path)
    }
}

#[derive(Debug)]
struct LocalFile {
    file: File,
}

impl StorageFile for LocalFile {
    #[cfg(unix)]
    fn lock(&self, mode: LockMode) -> io::Result<()> {
        // SAFETY: `self.file` owns the descriptor for the lifetime of `self`,
        // so it is valid for the duration of the `flock` call.
        let result = unsafe { libc::flock(self.file.as_raw_fd(), flock_arg(mode)) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&self, _mode: LockMode) -> io::Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn try_lock(&self, mode: LockMode) -> io::Result<bool> {
        // SAFETY: see `lock`; the descriptor outlives the call.
        let result =
            unsafe { libc::flock(self.file.as_raw_fd(), flock_arg(mode) | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn try_lock(&self, _mode: LockMode) -> io::Result<bool> {
        Ok(true)
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while let Some(rest) = buf.get_mut(done..).filter(|rest| !rest.is_empty()) {
            let read = self.file.seek_read(rest, offset + done as u64)?;
            if read == 0 {
                return Err(ErrorKind::UnexpectedEof.into());
            }
            done += read;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0;
        while let Some(rest) = buf.get(done..).filter(|rest| !rest.is_empty()) {
            let written = self.file.seek_write(rest, offset + done as u64)?;
            if written == 0 {
                return Err(ErrorKind::WriteZero.into());
            }
            done += written;
        }
        Ok(())
    }

    fn trim(&self, retain: u64, len: u64) -> io::Result<()> {
        let current = self.file.metadata()?.len();
        if current > retain {
            self.file.set_len(retain)?;
        }
        self.file.set_len(len)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(unix)]
const fn flock_arg(mode: LockMode) -> libc::c_int {
    match mode {
        LockMode::Exclusive => libc::LOCK_EX,
        LockMode::Shared => libc::LOCK_SH,
    }
}
