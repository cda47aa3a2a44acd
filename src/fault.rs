//! First-failure-wins fault propagation across worker threads.

use crate::error::{GradSyncError, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on how long any blocked thread can miss a raised fault.
/// Every condvar wait in the crate wakes at least this often to re-check
/// the cell.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Shared set-once error cell.
///
/// Any worker that fails records its error here before returning it to the
/// caller. Every blocking wait in the crate polls [`FaultCell::is_triggered`]
/// each wakeup, so all peers blocked on a barrier, gate, or full queue
/// unwind with [`GradSyncError::PropagatedPeer`] within one polling interval
/// instead of hanging on a worker that will never arrive.
#[derive(Debug, Default)]
pub struct FaultCell {
    triggered: AtomicBool,
    message: Mutex<Option<String>>,
}

impl FaultCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error` only if the cell is still empty; later calls are no-ops.
    pub fn set_if_first(&self, error: &GradSyncError) {
        let Ok(mut slot) = self.message.lock() else {
            // A poisoned cell still has to trip the flag so waiters abort.
            self.triggered.store(true, Ordering::Release);
            return;
        };
        if slot.is_none() {
            tracing::warn!(%error, "first worker failure recorded, unblocking peers");
            *slot = Some(error.to_string());
            self.triggered.store(true, Ordering::Release);
        }
    }

    /// Fast check used inside every spin/condvar wait loop.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// The error every blocked peer unwinds with once the cell is tripped.
    pub fn propagated(&self) -> GradSyncError {
        let message = self
            .message
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| "unknown peer failure".into());
        GradSyncError::PropagatedPeer { message }
    }

    /// Return `Err` immediately if a peer has already failed.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(self.propagated())
        } else {
            Ok(())
        }
    }

    /// Clear the cell so the training loop can restart after `reset()`.
    pub fn reset(&self) {
        if let Ok(mut slot) = self.message.lock() {
            *slot = None;
        }
        self.triggered.store(false, Ordering::Release);
    }
}
