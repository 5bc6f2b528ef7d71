//! A single cached remote object backed by one file in the cache directory.
//!
//! Entries are shared between the registry and every outstanding handle via
//! `Arc`; the backing file lives as long as the last holder. Construction
//! takes the [`DirectoryLock`] only to decide whether a finalized file can be
//! reused or a new one must be created.
//!
//! # On-disk layout
//!
//! ```text
//! <cache_dir>/.lock             directory lock (no data)
//! <cache_dir>/<key>             entry bytes
//! <cache_dir>/.complete/<key>   completion marker written by finalize
//! ```
//!
//! A file is trusted only if its completion marker records the file's current
//! length. Anything else is a leftover from a crashed populator and is removed
//! before a fresh entry is created. A populator that gives up in-process
//! removes its own file straight away, under the directory lock, so no other
//! process is left waiting on it.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use super::gate::{Admission, Phase, PopulationGate};
use super::lock::DirectoryLock;
use crate::error::{CacheError, ProtocolViolation, Result, StorageContext};
use crate::observability::{CACHE_TARGET, STORAGE_TARGET};
use crate::storage::{LockMode, Storage, StorageFile};

/// Subdirectory holding completion markers.
pub const MARKER_DIR: &str = ".complete";

/// Markers larger than this are treated as unreadable.
const MAX_MARKER_LEN: u64 = 4096;

/// Contents of a completion marker.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq)]
struct CompletionMarker {
    key: String,
    size: u64,
}

/// What the directory-locked inspection found for a key.
enum Existing {
    /// A finalized file, shared-locked and ready to read.
    Finalized {
        file: Box<dyn StorageFile>,
        size: u64,
    },
    /// Another process holds the file's write lock.
    Busy(Box<dyn StorageFile>),
    /// No usable file exists (stale leftovers were removed).
    Absent,
}

/// One cache entry. Obtain handles to it through
/// [`FileCacheRegistry`](super::FileCacheRegistry).
#[derive(Debug)]
pub struct CachedFile {
    key: String,
    cache_dir: Utf8PathBuf,
    path: Utf8PathBuf,
    marker_path: Utf8PathBuf,
    storage: Arc<dyn Storage>,
    /// `None` once the entry has given up its file.
    file: RwLock<Option<Box<dyn StorageFile>>>,
    gate: PopulationGate,
}

impl CachedFile {
    /// Opens the entry for `key`, reusing a finalized file when one exists.
    ///
    /// Returns `Ok(None)` when no finalized file exists and `allow_create` is
    /// false; the caller should then fall back to uncached access.
    ///
    /// When another process is populating the same key, the directory lock is
    /// released, the call blocks until that population ends, and the decision
    /// is taken again.
    pub(crate) fn open(
        storage: Arc<dyn Storage>,
        cache_dir: &Utf8Path,
        key: &str,
        allow_create: bool,
    ) -> Result<Option<Self>> {
        validate_key(key)?;
        let path = cache_dir.join(key);
        let marker_path = cache_dir.join(MARKER_DIR).join(key);

        loop {
            let dir_lock = DirectoryLock::acquire(storage.as_ref(), cache_dir)?;
            match inspect(storage.as_ref(), key, &path, &marker_path)? {
                Existing::Finalized { file, size } => {
                    debug!(target: CACHE_TARGET, key, size, "reusing finalized file");
                    return Ok(Some(Self {
                        key: key.to_owned(),
                        cache_dir: cache_dir.to_path_buf(),
                        path,
                        marker_path,
                        storage,
                        file: RwLock::new(Some(file)),
                        gate: PopulationGate::initialized(size),
                    }));
                }
                Existing::Busy(file) => {
                    dir_lock.release();
                    debug!(target: CACHE_TARGET, key, "waiting for another process to populate");
                    file.lock(LockMode::Shared)
                        .storage_context(|| format!("wait for population of {path}"))?;
                }
                Existing::Absent if !allow_create => {
                    debug!(target: CACHE_TARGET, key, "no cached file and creation disabled");
                    return Ok(None);
                }
                Existing::Absent => {
                    let file = create_for_population(storage.as_ref(), &path, &marker_path)?;
                    dir_lock.release();
                    debug!(target: CACHE_TARGET, key, path = %path, "created file for population");
                    return Ok(Some(Self {
                        key: key.to_owned(),
                        cache_dir: cache_dir.to_path_buf(),
                        path,
                        marker_path,
                        storage,
                        file: RwLock::new(Some(file)),
                        gate: PopulationGate::uninitialized(),
                    }));
                }
            }
        }
    }

    /// Returns the key this entry caches.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Returns the entry's current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.gate.snapshot().phase
    }

    /// Returns `true` once the entry has been finalized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.phase() == Phase::Initialized
    }

    /// Returns the logical size: the finalized size, or zero before that.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.gate.snapshot().size
    }

    /// Returns the number of bytes currently allocated on disk.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.gate.snapshot().capacity
    }

    pub(crate) fn admit(&self) -> Admission {
        self.gate.admit()
    }

    fn with_file<T>(&self, op: impl FnOnce(&dyn StorageFile) -> io::Result<T>) -> io::Result<T> {
        let slot = self.file.read().unwrap_or_else(PoisonError::into_inner);
        let file = slot
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "entry file was released"))?;
        op(file)
    }

    /// Pre-sizes the backing file. Caller must hold the population lock.
    pub(crate) fn allocate(&self, size: u64) -> Result<()> {
        let state = self.gate.snapshot();
        if state.allocated {
            return Err(ProtocolViolation::AlreadyAllocated.into());
        }
        self.with_file(|file| file.trim(0, size))
            .storage_context(|| format!("allocate {size} bytes for {}", self.path))?;
        self.gate.set_capacity(size);
        debug!(target: CACHE_TARGET, key = %self.key, size, "allocated entry");
        Ok(())
    }

    /// Extends the backing file. Caller must hold the population lock.
    pub(crate) fn grow(&self, new_capacity: u64, bytes_retained: u64) -> Result<()> {
        let state = self.gate.snapshot();
        if new_capacity < state.capacity {
            return Err(ProtocolViolation::CapacityShrink {
                current: state.capacity,
                requested: new_capacity,
            }
            .into());
        }
        if bytes_retained > state.capacity {
            return Err(ProtocolViolation::RetainBeyondCapacity {
                retained: bytes_retained,
                capacity: state.capacity,
            }
            .into());
        }
        self.with_file(|file| file.trim(bytes_retained, new_capacity))
            .storage_context(|| format!("grow {} to {new_capacity} bytes", self.path))?;
        self.gate.set_capacity(new_capacity);
        debug!(
            target: CACHE_TARGET,
            key = %self.key,
            new_capacity,
            bytes_retained,
            "grew entry"
        );
        Ok(())
    }

    /// Writes into the allocated region. Caller must hold the population lock.
    pub(crate) fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let capacity = self.gate.snapshot().capacity;
        let len = buf.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > capacity) {
            return Err(ProtocolViolation::WriteBeyondCapacity {
                offset,
                len,
                capacity,
            }
            .into());
        }
        self.with_file(|file| file.write_at(buf, offset))
            .storage_context(|| format!("write {len} bytes at {offset} to {}", self.path))
    }

    /// Reads finalized bytes. Caller must hold no lock.
    pub(crate) fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let size = self.gate.snapshot().size;
        let len = buf.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > size) {
            return Err(ProtocolViolation::ReadBeyondSize { offset, len, size }.into());
        }
        self.with_file(|file| file.read_at(buf, offset))
            .storage_context(|| format!("read {len} bytes at {offset} from {}", self.path))
    }

    /// Flushes the data, records the completion marker, swaps the write
    /// handle for a shared-locked read handle, and publishes the entry.
    /// Caller must hold the population lock.
    pub(crate) fn finalize(&self, total_size: u64) -> Result<()> {
        let capacity = self.gate.snapshot().capacity;
        if total_size > capacity {
            return Err(ProtocolViolation::SizeBeyondCapacity {
                size: total_size,
                capacity,
            }
            .into());
        }

        self.with_file(|writer| writer.trim(total_size, total_size))
            .storage_context(|| format!("truncate {} to {total_size} bytes", self.path))?;
        self.with_file(|writer| writer.sync())
            .storage_context(|| format!("flush {}", self.path))?;

        let reader = self
            .storage
            .open_read(&self.path)
            .storage_context(|| format!("reopen {} for reading", self.path))?
            .ok_or_else(|| CacheError::Storage {
                context: format!("reopen {} for reading", self.path),
                source: std::io::ErrorKind::NotFound.into(),
            })?;

        if let Err(err) = self.write_marker(total_size) {
            self.remove_marker();
            return Err(err);
        }

        {
            let mut slot = self.file.write().unwrap_or_else(PoisonError::into_inner);
            // Closing the writer releases the exclusive lock.
            drop(slot.take());
            if let Err(err) = reader
                .lock(LockMode::Shared)
                .storage_context(|| format!("lock finalized {} for reading", self.path))
            {
                self.remove_marker();
                return Err(err);
            }
            *slot = Some(reader);
        }

        self.gate.finish(total_size)?;
        debug!(target: CACHE_TARGET, key = %self.key, size = total_size, "entry finalized");
        Ok(())
    }

    /// Discards the partially written file and marks the entry abandoned.
    /// Waiting handles in this process retry their lookup; other processes
    /// blocked on the file lock wake once the writer is closed.
    pub(crate) fn abandon(&self) {
        if self.gate.snapshot().phase != Phase::Populating {
            return;
        }
        warn!(target: CACHE_TARGET, key = %self.key, "population abandoned before finalize");
        self.release_claim();
        self.gate.abandon();
    }

    /// Removes the marker, then the backing file, then closes the file handle,
    /// all under the directory lock.
    ///
    /// The marker goes first: while the exclusively locked file still exists
    /// nobody else can finalize this key, so the removal never touches a
    /// marker written by a later population.
    fn release_claim(&self) {
        let dir_lock = match DirectoryLock::acquire(self.storage.as_ref(), &self.cache_dir) {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!(
                    target: STORAGE_TARGET,
                    path = %self.path,
                    error = %err,
                    "discarding entry without the directory lock"
                );
                None
            }
        };
        self.remove_marker();
        if let Err(err) = self.storage.remove(&self.path) {
            warn!(
                target: STORAGE_TARGET,
                path = %self.path,
                error = %err,
                "failed to remove unfinalized file"
            );
        }
        drop(self.file.write().unwrap_or_else(PoisonError::into_inner).take());
        drop(dir_lock);
    }

    fn write_marker(&self, size: u64) -> Result<()> {
        let record = CompletionMarker {
            key: self.key.clone(),
            size,
        };
        let bytes = serde_json::to_vec(&record).map_err(|err| CacheError::Storage {
            context: format!("encode marker {}", self.marker_path),
            source: err.into(),
        })?;
        let marker = self
            .storage
            .open_write(&self.marker_path)
            .storage_context(|| format!("create marker {}", self.marker_path))?;
        marker
            .trim(0, 0)
            .and_then(|()| marker.write_at(&bytes, 0))
            .and_then(|()| marker.sync())
            .storage_context(|| format!("write marker {}", self.marker_path))
    }

    fn remove_marker(&self) {
        if let Err(err) = self.storage.remove(&self.marker_path) {
            warn!(
                target: STORAGE_TARGET,
                path = %self.marker_path,
                error = %err,
                "failed to remove completion marker"
            );
        }
    }
}

impl Drop for CachedFile {
    fn drop(&mut self) {
        match self.gate.snapshot().phase {
            Phase::Initialized | Phase::Abandoned => {}
            Phase::Uninitialized | Phase::Populating => {
                debug!(target: STORAGE_TARGET, path = %self.path, "removing unfinalized file");
                self.release_claim();
            }
        }
    }
}

/// Rejects keys that would escape the cache directory or collide with the
/// coordination files.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.contains(['/', '\\', '\0']) {
        Some("key contains a path separator")
    } else if key.starts_with('.') {
        Some("keys starting with '.' are reserved")
    } else {
        None
    };
    reason.map_or(Ok(()), |why| {
        Err(CacheError::InvalidKey {
            key: key.to_owned(),
            reason: why,
        })
    })
}

/// Checks for a reusable file. Must run under the directory lock.
fn inspect(
    storage: &dyn Storage,
    key: &str,
    path: &Utf8Path,
    marker_path: &Utf8Path,
) -> Result<Existing> {
    let Some(file) = storage
        .open_read(path)
        .storage_context(|| format!("open {path}"))?
    else {
        storage
            .remove(marker_path)
            .storage_context(|| format!("remove orphaned marker {marker_path}"))?;
        return Ok(Existing::Absent);
    };

    if !file
        .try_lock(LockMode::Shared)
        .storage_context(|| format!("lock {path} for reading"))?
    {
        return Ok(Existing::Busy(file));
    }

    let size = file.size().storage_context(|| format!("stat {path}"))?;
    match read_marker(storage, marker_path)? {
        Some(marker) if marker.key == key && marker.size == size => {
            Ok(Existing::Finalized { file, size })
        }
        marker => {
            drop(file);
            warn!(
                target: STORAGE_TARGET,
                path = %path,
                size,
                recorded = ?marker.map(|m| m.size),
                "removing stale file left by an unfinished population"
            );
            storage
                .remove(path)
                .storage_context(|| format!("remove stale file {path}"))?;
            storage
                .remove(marker_path)
                .storage_context(|| format!("remove stale marker {marker_path}"))?;
            Ok(Existing::Absent)
        }
    }
}

fn read_marker(storage: &dyn Storage, marker_path: &Utf8Path) -> Result<Option<CompletionMarker>> {
    let Some(file) = storage
        .open_read(marker_path)
        .storage_context(|| format!("open marker {marker_path}"))?
    else {
        return Ok(None);
    };
    let size = file
        .size()
        .storage_context(|| format!("stat marker {marker_path}"))?;
    let Some(len) = usize::try_from(size).ok().filter(|_| size <= MAX_MARKER_LEN) else {
        debug!(
            target: STORAGE_TARGET,
            path = %marker_path,
            size,
            "ignoring oversized completion marker"
        );
        return Ok(None);
    };
    let mut bytes = vec![0_u8; len];
    file.read_at(&mut bytes, 0)
        .storage_context(|| format!("read marker {marker_path}"))?;

    match serde_json::from_slice(&bytes) {
        Ok(marker) => Ok(Some(marker)),
        Err(err) => {
            debug!(
                target: STORAGE_TARGET,
                path = %marker_path,
                error = %err,
                "ignoring unreadable completion marker"
            );
            Ok(None)
        }
    }
}

/// Creates an empty, exclusively locked file. Must run under the directory
/// lock after [`inspect`] reported the key absent.
fn create_for_population(
    storage: &dyn Storage,
    path: &Utf8Path,
    marker_path: &Utf8Path,
) -> Result<Box<dyn StorageFile>> {
    if let Some(marker_dir) = marker_path.parent() {
        storage
            .create_dir_all(marker_dir)
            .storage_context(|| format!("create {marker_dir}"))?;
    }
    let file = storage
        .open_write(path)
        .storage_context(|| format!("create {path}"))?;
    file.lock(LockMode::Exclusive)
        .storage_context(|| format!("lock {path} for writing"))?;
    file.trim(0, 0)
        .storage_context(|| format!("truncate {path}"))?;
    Ok(file)
}
