//! External update sources: a second channel (typically fed by a
//! cross-process or cross-node transport) whose contribution is folded into
//! every consumer's apply step alongside locally replicated messages.

use crate::encoding::message::{decode_into, validate};
use crate::error::{GradSyncError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

/// Optional secondary source of already-encoded updates.
///
/// `register_consumers` and `fallback_to_single_consumer` default to no-ops
/// for sources that do not track per-consumer state.
pub trait ExternalSource: Send + Sync {
    /// True if the calling consumer has pending updates it has not drained.
    fn has_anything(&self) -> bool;

    /// Decode every pending update for the calling consumer into `updates`
    /// (accumulating), returning how many messages were applied.
    fn drain_to(&self, updates: &mut [f32]) -> Result<usize>;

    /// Expected number of consumers for the current step.
    fn register_consumers(&self, _n: usize) {}

    /// Switch to/from single-consumer mode.
    fn fallback_to_single_consumer(&self, _enable: bool) {}
}

#[derive(Debug, Default)]
struct TailState {
    /// Sequence numbers every registered consumer has already passed.
    collapsed: u64,
    /// Highest sequence number published.
    last: u64,
    /// Retained messages, keyed by sequence number.
    messages: BTreeMap<u64, Vec<u8>>,
    /// Per-consumer drain cursor (highest sequence consumed).
    positions: HashMap<ThreadId, u64>,
}

/// Sequence-numbered tail of encoded messages with per-consumer cursors.
///
/// Each consumer thread sees every message exactly once; a message is
/// pruned as soon as all expected consumers have drained past it. New
/// consumers join at the collapse point, so they never replay updates that
/// the rest of the group already applied.
#[derive(Debug, Default)]
pub struct IndexedSource {
    state: Mutex<TailState>,
    expected_consumers: AtomicUsize,
}

impl IndexedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an encoded message to every consumer.
    ///
    /// The frame is structurally validated on ingest so an undecodable
    /// message can never be retained; it is rejected at the boundary
    /// rather than inside a consumer's apply step.
    pub fn put(&self, bytes: Vec<u8>) -> Result<()> {
        validate(&bytes)?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("indexed source"))?;
        state.last += 1;
        let seq = state.last;
        state.messages.insert(seq, bytes);
        Ok(())
    }

    /// Messages currently retained (pending for at least one consumer).
    pub fn retained(&self) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("indexed source"))?
            .messages
            .len())
    }

    fn prune(state: &mut TailState, expected: usize) {
        // Collapse only once every expected consumer has reported a cursor;
        // otherwise a late-registering consumer would miss messages.
        if expected == 0 || state.positions.len() < expected {
            return;
        }
        let min_pos = state
            .positions
            .values()
            .copied()
            .min()
            .unwrap_or(state.collapsed);
        if min_pos > state.collapsed {
            state.collapsed = min_pos;
            state.messages = state.messages.split_off(&(min_pos + 1));
        }
    }
}

impl ExternalSource for IndexedSource {
    fn has_anything(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        let cursor = state
            .positions
            .get(&std::thread::current().id())
            .copied()
            .unwrap_or(state.collapsed);
        cursor < state.last
    }

    fn drain_to(&self, updates: &mut [f32]) -> Result<usize> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("indexed source"))?;
        let state = &mut *guard;
        let tid = std::thread::current().id();
        let mut cursor = state.positions.get(&tid).copied().unwrap_or(state.collapsed);

        // The cursor advances per message: whatever already went into
        // `updates` is never replayed by a retry after a failed decode.
        let mut applied = 0usize;
        let mut failure = None;
        for (&seq, bytes) in state.messages.range((cursor + 1)..) {
            match decode_into(bytes, updates) {
                Ok(()) => {
                    cursor = seq;
                    applied += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        state.positions.insert(tid, cursor);
        Self::prune(state, self.expected_consumers.load(Ordering::Acquire));
        match failure {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    fn register_consumers(&self, n: usize) {
        self.expected_consumers.store(n, Ordering::Release);
    }

    fn fallback_to_single_consumer(&self, enable: bool) {
        if enable {
            self.expected_consumers.store(1, Ordering::Release);
        }
    }
}
