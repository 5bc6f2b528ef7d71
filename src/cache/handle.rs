//! Scoped accessor enforcing the write-phase/read-phase discipline.

use camino::Utf8Path;
use std::sync::Arc;

use super::entry::CachedFile;
use super::gate::Admission;
use crate::error::{ProtocolViolation, Result};

/// Caller-held access to one [`CachedFile`].
///
/// A handle created while the entry is uninitialized holds the entry's
/// population lock until it is finalized or dropped; only such a handle may
/// allocate, grow, write, and finalize. A handle created for a finalized entry
/// holds no lock and may only read.
///
/// Dropping a populating handle without calling
/// [`finalize`](Self::finalize) removes the partial file and retires the
/// entry. Waiting lookups, in this process or another, then start over and one
/// of them populates a fresh entry.
///
/// # Examples
///
/// ```no_run
/// use camino::Utf8Path;
/// use cached_httpfs::FileCacheRegistry;
///
/// let registry = FileCacheRegistry::new();
/// let dir = Utf8Path::new("/tmp/httpfs");
/// if let Some(mut handle) = registry.get_entry(dir, "object1", true)? {
///     if handle.is_populating() {
///         let body = b"fetched from the remote store";
///         handle.allocate(body.len() as u64)?;
///         handle.write(body, 0)?;
///         handle.finalize(body.len() as u64)?;
///     }
///     let bytes = handle.read_to_vec()?;
///     assert_eq!(bytes.len() as u64, handle.size());
/// }
/// # Ok::<(), cached_httpfs::CacheError>(())
/// ```
#[derive(Debug)]
pub struct CachedFileHandle {
    file: Arc<CachedFile>,
    populating: bool,
}

impl CachedFileHandle {
    /// Wraps `file`, blocking while another handle is populating it.
    ///
    /// Returns `None` if the entry was abandoned; the caller must look the
    /// key up again.
    pub(crate) fn admit(file: Arc<CachedFile>) -> Option<Self> {
        let populating = match file.admit() {
            Admission::Populate => true,
            Admission::Read => false,
            Admission::Retry => return None,
        };
        Some(Self { file, populating })
    }

    /// Returns the key of the underlying entry.
    #[must_use]
    pub fn key(&self) -> &str {
        self.file.key()
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        self.file.path()
    }

    /// Returns `true` while this handle holds the population lock.
    #[must_use]
    pub const fn is_populating(&self) -> bool {
        self.populating
    }

    /// Returns `true` once the entry is finalized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.file.is_initialized()
    }

    /// Returns the finalized size, or zero while populating.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Returns the bytes currently allocated on disk.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.file.capacity()
    }

    /// Returns the shared entry behind this handle.
    #[must_use]
    pub const fn entry(&self) -> &Arc<CachedFile> {
        &self.file
    }

    fn ensure_populating(&self, op: &'static str) -> Result<()> {
        if self.populating {
            Ok(())
        } else {
            Err(ProtocolViolation::AlreadyInitialized { op }.into())
        }
    }

    /// Pre-sizes the backing file to `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the entry is finalized or was already
    /// allocated during this population, or a storage error if resizing fails.
    pub fn allocate(&mut self, size: u64) -> Result<()> {
        self.ensure_populating("allocate")?;
        self.file.allocate(size)
    }

    /// Extends the backing file to `new_capacity` bytes, keeping the first
    /// `bytes_retained` bytes. Use this when the final size only becomes known
    /// as the transfer progresses.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the entry is finalized, the capacity
    /// would shrink, or more bytes are retained than were allocated.
    pub fn grow_file(&mut self, new_capacity: u64, bytes_retained: u64) -> Result<()> {
        self.ensure_populating("grow")?;
        self.file.grow(new_capacity, bytes_retained)
    }

    /// Writes `buf` at `offset` inside the allocated region.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the entry is finalized or the write
    /// exceeds the allocated capacity.
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.ensure_populating("write")?;
        self.file.write(buf, offset)
    }

    /// Marks the entry complete with `total_size` bytes and releases the
    /// population lock. Waiting handles wake up as readers.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the entry is already finalized or
    /// `total_size` exceeds the allocated capacity. On a storage error the
    /// handle keeps the population lock and the entry stays unfinalized;
    /// dropping the handle then discards it.
    pub fn finalize(&mut self, total_size: u64) -> Result<()> {
        self.ensure_populating("finalize")?;
        self.file.finalize(total_size)?;
        self.populating = false;
        Ok(())
    }

    /// Fills `buf` with finalized bytes starting at `offset`. Concurrent reads
    /// from any number of handles are safe.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if this handle is populating or the range
    /// exceeds the finalized size.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.populating {
            return Err(ProtocolViolation::ReadWhilePopulating.into());
        }
        self.file.read(buf, offset)
    }

    /// Reads the whole finalized entry into memory.
    ///
    /// # Errors
    ///
    /// See [`read`](Self::read).
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.size()).map_err(|_| crate::CacheError::Storage {
            context: format!("{} does not fit in memory", self.path()),
            source: std::io::ErrorKind::OutOfMemory.into(),
        })?;
        let mut buf = vec![0_u8; len];
        self.read(&mut buf, 0)?;
        Ok(buf)
    }
}

impl Drop for CachedFileHandle {
    fn drop(&mut self) {
        if self.populating {
            self.file.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, Storage};
    use camino::Utf8PathBuf;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn new_entry() -> (TempDir, Arc<CachedFile>) {
        let temp = tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8 path");
        let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new());
        let entry = CachedFile::open(storage, &root, "object1", true)
            .expect("open")
            .expect("created");
        (temp, Arc::new(entry))
    }

    #[test]
    fn first_handle_populates_and_second_reads() {
        let (_temp, entry) = new_entry();
        let mut writer = CachedFileHandle::admit(Arc::clone(&entry)).expect("admitted");
        assert!(writer.is_populating());

        writer.allocate(3).expect("allocate");
        writer.write(b"abc", 0).expect("write");
        writer.finalize(3).expect("finalize");
        assert!(!writer.is_populating());
        assert!(writer.is_initialized());

        let reader = CachedFileHandle::admit(entry).expect("admitted");
        assert!(!reader.is_populating());
        assert_eq!(reader.read_to_vec().expect("read"), b"abc");
    }

    #[test]
    fn read_while_populating_is_rejected() {
        let (_temp, entry) = new_entry();
        let writer = CachedFileHandle::admit(entry).expect("admitted");

        let mut buf = [0_u8; 1];
        let err = writer.read(&mut buf, 0).expect_err("populating");
        assert_eq!(err.as_protocol(), Some(&ProtocolViolation::ReadWhilePopulating));
    }

    #[test]
    fn write_phase_operations_fail_after_finalize() {
        let (_temp, entry) = new_entry();
        let mut writer = CachedFileHandle::admit(entry).expect("admitted");
        writer.allocate(1).expect("allocate");
        writer.write(b"x", 0).expect("write");
        writer.finalize(1).expect("finalize");

        for (op, result) in [
            ("finalize", writer.finalize(1)),
            ("write", writer.write(b"y", 0)),
            ("allocate", writer.allocate(1)),
            ("grow", writer.grow_file(2, 1)),
        ] {
            let err = result.expect_err("finalized");
            assert_eq!(
                err.as_protocol(),
                Some(&ProtocolViolation::AlreadyInitialized { op })
            );
        }
    }

    #[test]
    fn dropped_handle_sends_waiters_back_to_lookup() {
        let (_temp, entry) = new_entry();
        let mut abandoned = CachedFileHandle::admit(Arc::clone(&entry)).expect("admitted");
        abandoned.allocate(4).expect("allocate");
        abandoned.write(b"junk", 0).expect("write");

        let (tx, rx) = mpsc::channel();
        let waiter_entry = Arc::clone(&entry);
        let waiter = thread::spawn(move || {
            let admitted = CachedFileHandle::admit(waiter_entry).is_some();
            tx.send(admitted).expect("report");
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(abandoned);
        let admitted = rx.recv_timeout(Duration::from_secs(5)).expect("waiter wakes");
        assert!(!admitted);
        waiter.join().expect("waiter joins");

        assert!(!entry.path().exists());
        assert!(CachedFileHandle::admit(entry).is_none());
    }

    #[test]
    fn waiter_reads_after_finalize() {
        let (_temp, entry) = new_entry();
        let mut writer = CachedFileHandle::admit(Arc::clone(&entry)).expect("admitted");

        let waiter_entry = Arc::clone(&entry);
        let waiter = thread::spawn(move || {
            let handle = CachedFileHandle::admit(waiter_entry).expect("admitted");
            assert!(!handle.is_populating());
            (handle.size(), handle.read_to_vec().expect("read"))
        });

        thread::sleep(Duration::from_millis(50));
        writer.allocate(100).expect("allocate");
        writer.write(&[7_u8; 100], 0).expect("write");
        writer.finalize(100).expect("finalize");

        let (size, bytes) = waiter.join().expect("waiter joins");
        assert_eq!(size, 100);
        assert_eq!(bytes, vec![7_u8; 100]);
    }
}
