//! Per-consumer channel: a bounded message queue backed by a dedicated
//! arena of recycled slots.
//!
//! Every registered worker owns exactly one channel. Producers replicate
//! each encoded message into every channel; the copy into the channel's own
//! arena guarantees no two consumers alias the same backing memory across
//! threads or devices.

use crate::error::{GradSyncError, Result};
use crate::fault::{FaultCell, POLL_INTERVAL};
use crossbeam_queue::ArrayQueue;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex};

/// Fixed pool of same-sized byte slots for one channel.
///
/// Slots are pre-allocated once and recycled through a lock-free queue.
/// A drained-but-not-yet-decoded message still holds its slot, so checkout
/// falls back to a fresh allocation when the pool runs dry instead of
/// blocking.
pub struct ArenaPool {
    slots: ArrayQueue<Vec<u8>>,
    slot_size: usize,
}

impl ArenaPool {
    pub fn new(slot_size: usize, slot_count: usize) -> Arc<Self> {
        let slots = ArrayQueue::new(slot_count.max(1));
        for _ in 0..slot_count {
            let _ = slots.push(Vec::with_capacity(slot_size));
        }
        Arc::new(Self { slots, slot_size })
    }

    /// Bytes one slot can hold.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Copy `bytes` into a recycled (or fresh) slot.
    ///
    /// Fails with [`GradSyncError::Capacity`] when the message cannot fit a
    /// slot; partial writes are never attempted.
    pub fn checkout(self: &Arc<Self>, bytes: &[u8]) -> Result<ArenaSlot> {
        if bytes.len() > self.slot_size {
            return Err(GradSyncError::Capacity {
                required: bytes.len(),
                slot: self.slot_size,
            });
        }
        let mut buf = self
            .slots
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.slot_size));
        buf.clear();
        buf.extend_from_slice(bytes);
        Ok(ArenaSlot {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    fn return_buf(&self, mut buf: Vec<u8>) {
        // Slots that grew past the arena size are dropped, not recycled.
        if buf.capacity() <= self.slot_size {
            buf.clear();
            let _ = self.slots.push(buf);
        }
    }
}

/// One message held in a channel's arena. Derefs to the wire bytes; the
/// backing buffer returns to the pool on drop.
pub struct ArenaSlot {
    buf: Option<Vec<u8>>,
    pool: Arc<ArenaPool>,
}

impl Deref for ArenaSlot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Invariant: `buf` is `Some` from construction until `Drop`.
        self.buf.as_deref().expect("ArenaSlot used after drop")
    }
}

impl Drop for ArenaSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_buf(buf);
        }
    }
}

/// Bounded FIFO of encoded messages for one consumer.
pub struct ConsumerChannel {
    queue: Mutex<VecDeque<ArenaSlot>>,
    space_available: Condvar,
    arena: Arc<ArenaPool>,
    capacity: usize,
}

impl ConsumerChannel {
    pub fn new(slot_size: usize, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            space_available: Condvar::new(),
            arena: ArenaPool::new(slot_size, capacity),
            capacity,
        }
    }

    /// Copy `bytes` into this channel's arena and enqueue the message.
    ///
    /// Blocks with backpressure while the queue is full; aborts with
    /// [`GradSyncError::PropagatedPeer`] if a peer fails while waiting.
    pub fn put(&self, bytes: &[u8], fault: &FaultCell) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("channel queue"))?;
        while queue.len() >= self.capacity {
            fault.check()?;
            let (guard, _) = self
                .space_available
                .wait_timeout(queue, POLL_INTERVAL)
                .map_err(|_| GradSyncError::LockPoisoned("channel queue"))?;
            queue = guard;
        }
        let slot = self.arena.checkout(bytes)?;
        queue.push_back(slot);
        Ok(())
    }

    /// Remove and return every queued message. Non-blocking.
    pub fn drain(&self) -> Result<Vec<ArenaSlot>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("channel queue"))?;
        let drained: Vec<ArenaSlot> = queue.drain(..).collect();
        drop(queue);
        if !drained.is_empty() {
            self.space_available.notify_all();
        }
        Ok(drained)
    }

    /// Drop everything queued (their slots return to the arena).
    pub fn clear(&self) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("channel queue"))?;
        queue.clear();
        drop(queue);
        self.space_available.notify_all();
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self
            .queue
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("channel queue"))?
            .is_empty())
    }
}
