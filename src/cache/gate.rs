//! Population state machine shared by every handle to one entry.
//!
//! The gate owns the entry's phase together with the size bookkeeping that
//! only the populator may change. Admission blocks while another handle is
//! populating and re-examines the phase once woken, so a waiter either reads
//! the finalized entry or learns that the population was abandoned and the
//! entry must be opened afresh.

#[cfg(feature = "loom-tests")]
use loom::sync::{Condvar, Mutex, MutexGuard};
#[cfg(not(feature = "loom-tests"))]
use std::sync::{Condvar, Mutex, MutexGuard};

use std::sync::PoisonError;

use crate::error::ProtocolViolation;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    /// No valid data; the next admitted handle becomes the populator.
    Uninitialized,
    /// A single handle holds the population lock and is filling the entry.
    Populating,
    /// Complete and immutable; safe for concurrent reads.
    Initialized,
    /// The populator gave up and the backing file was discarded. The entry is
    /// dead; lookups replace it with a freshly opened one.
    Abandoned,
}

/// Outcome of [`PopulationGate::admit`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Admission {
    /// The caller now holds the population lock.
    Populate,
    /// The entry is finalized; the caller holds no lock.
    Read,
    /// The entry was abandoned; the caller must look the key up again.
    Retry,
}

/// Snapshot of an entry's bookkeeping.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct GateState {
    pub(crate) phase: Phase,
    pub(crate) size: u64,
    pub(crate) capacity: u64,
    pub(crate) allocated: bool,
}

impl GateState {
    const fn uninitialized() -> Self {
        Self {
            phase: Phase::Uninitialized,
            size: 0,
            capacity: 0,
            allocated: false,
        }
    }

    const fn initialized(size: u64) -> Self {
        Self {
            phase: Phase::Initialized,
            size,
            capacity: size,
            allocated: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PopulationGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl PopulationGate {
    /// Creates a gate for an entry with no valid data yet.
    pub(crate) fn uninitialized() -> Self {
        Self::with_state(GateState::uninitialized())
    }

    /// Creates a gate for an entry already finalized on disk.
    pub(crate) fn initialized(size: u64) -> Self {
        Self::with_state(GateState::initialized(size))
    }

    fn with_state(state: GateState) -> Self {
        Self {
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the entry is free to populate, finalized, or abandoned.
    pub(crate) fn admit(&self) -> Admission {
        let mut state = self.lock();
        loop {
            match state.phase {
                Phase::Initialized => return Admission::Read,
                Phase::Abandoned => return Admission::Retry,
                Phase::Uninitialized => {
                    state.phase = Phase::Populating;
                    return Admission::Populate;
                }
                Phase::Populating => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Returns a copy of the current bookkeeping.
    pub(crate) fn snapshot(&self) -> GateState {
        *self.lock()
    }

    /// Records a new allocation made by the populator.
    pub(crate) fn set_capacity(&self, capacity: u64) {
        let mut state = self.lock();
        state.capacity = capacity;
        state.allocated = true;
    }

    /// Publishes the finalized size and wakes every waiter.
    pub(crate) fn finish(&self, size: u64) -> Result<(), ProtocolViolation> {
        let mut state = self.lock();
        if state.phase != Phase::Populating {
            return Err(ProtocolViolation::AlreadyInitialized { op: "finalize" });
        }
        *state = GateState::initialized(size);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Marks a populating entry as abandoned and wakes every waiter so each
    /// can retry its lookup.
    pub(crate) fn abandon(&self) {
        let mut state = self.lock();
        if state.phase != Phase::Populating {
            return;
        }
        *state = GateState {
            phase: Phase::Abandoned,
            ..GateState::uninitialized()
        };
        drop(state);
        self.changed.notify_all();
    }
}
