//! Rendezvous barrier and registration gate.
//!
//! The barrier synchronizes a dynamically supplied number of worker threads
//! at the end of each step. A generation counter makes it immediately
//! reusable: a thread that oversleeps past its own release observes the
//! bumped generation and leaves, so stale counter state can never bleed into
//! a later step with a different participant count.

use crate::error::{GradSyncError, Result};
use crate::fault::{FaultCell, POLL_INTERVAL};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct BarrierState {
    entered: usize,
    generation: u64,
}

/// Reusable all-arrive-then-release barrier with per-step participant counts.
#[derive(Debug, Default)]
pub struct RendezvousBarrier {
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl RendezvousBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `parties` threads have called `wait` for the current
    /// generation.
    ///
    /// The last thread to arrive runs `on_release` (while holding the
    /// barrier lock, before anyone is released) and wakes the rest.
    /// `parties <= 1` short-circuits: `on_release` runs and the call
    /// returns immediately.
    ///
    /// Every wakeup checks `fault`; a tripped cell aborts the wait with
    /// [`GradSyncError::PropagatedPeer`] instead of waiting for a peer that
    /// will never arrive.
    pub fn wait(
        &self,
        parties: usize,
        fault: &FaultCell,
        on_release: impl FnOnce(),
    ) -> Result<()> {
        if parties <= 1 {
            on_release();
            return Ok(());
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("barrier"))?;
        let generation = state.generation;
        state.entered += 1;

        if state.entered == parties {
            state.entered = 0;
            state.generation = state.generation.wrapping_add(1);
            on_release();
            drop(state);
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation {
            fault.check()?;
            let (guard, _) = self
                .released
                .wait_timeout(state, POLL_INTERVAL)
                .map_err(|_| GradSyncError::LockPoisoned("barrier"))?;
            state = guard;
        }
        Ok(())
    }
}

/// Boolean gate guarding the per-step registration handshake.
///
/// Workers block in `wait_open` until the controlling harness has declared
/// the step's consumer count; the harness blocks in `wait_closed` so two
/// consecutive registrations cannot overlap.
#[derive(Debug, Default)]
pub struct StepGate {
    flag: Mutex<bool>,
    changed: Condvar,
}

impl StepGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> Result<()> {
        self.set(true)
    }

    pub fn close(&self) -> Result<()> {
        self.set(false)
    }

    fn set(&self, value: bool) -> Result<()> {
        let mut flag = self
            .flag
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("step gate"))?;
        *flag = value;
        drop(flag);
        self.changed.notify_all();
        Ok(())
    }

    pub fn is_open(&self) -> Result<bool> {
        Ok(*self
            .flag
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("step gate"))?)
    }

    /// Block until the gate is open, polling `fault` every interval.
    pub fn wait_open(&self, fault: &FaultCell) -> Result<()> {
        self.wait_for(true, fault)
    }

    /// Block until the gate is closed, polling `fault` every interval.
    pub fn wait_closed(&self, fault: &FaultCell) -> Result<()> {
        self.wait_for(false, fault)
    }

    fn wait_for(&self, value: bool, fault: &FaultCell) -> Result<()> {
        let mut flag = self
            .flag
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("step gate"))?;
        while *flag != value {
            fault.check()?;
            let (guard, _) = self
                .changed
                .wait_timeout(flag, POLL_INTERVAL)
                .map_err(|_| GradSyncError::LockPoisoned("step gate"))?;
            flag = guard;
        }
        Ok(())
    }
}
