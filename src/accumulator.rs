//! The accumulator orchestrator: accepts each worker's local delta, encodes
//! and fans it out to every registered consumer, and drives the per-step
//! rendezvous so all workers apply one consistent combined update.

use crate::affinity::AffinityProvider;
use crate::barrier::{RendezvousBarrier, StepGate};
use crate::channel::ConsumerChannel;
use crate::config::AccumulatorConfig;
use crate::encoding::message::decode_into;
use crate::encoding::threshold::StepStats;
use crate::error::{GradSyncError, Result};
use crate::external::ExternalSource;
use crate::fault::FaultCell;
use crate::handler::EncodingHandler;
use crate::types::{StepFunction, WorkerIndex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Per-worker state, owned by the worker thread and passed explicitly into
/// every call.
///
/// Obtained from [`EncodedGradientAccumulator::touch`]; the consumer index
/// is fixed for the context's lifetime. After
/// [`EncodedGradientAccumulator::reset`], outstanding contexts are stale
/// and workers must `touch()` again.
pub struct WorkerContext {
    index: WorkerIndex,
    residual: Option<Vec<f32>>,
    last_stats: Option<StepStats>,
    updates_applied: u64,
}

impl WorkerContext {
    /// This worker's stable consumer index.
    pub fn index(&self) -> WorkerIndex {
        self.index
    }

    /// Total messages this worker has decoded and applied so far.
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }
}

/// Gradient accumulator with threshold-encoded broadcast between workers.
///
/// Shared by reference (`Arc`) across all worker threads. Each step:
/// every worker calls [`store_update`](Self::store_update) with its local
/// delta, then every worker calls [`apply_update`](Self::apply_update),
/// which drains that worker's own channel and applies the combined update
/// through the supplied step function.
pub struct EncodedGradientAccumulator {
    parties: usize,
    handler: EncodingHandler,
    channels: Vec<ConsumerChannel>,
    barrier: RendezvousBarrier,
    registration: StepGate,
    fault: FaultCell,
    affinity: Arc<dyn AffinityProvider>,

    current_consumers: AtomicUsize,
    workers_counter: AtomicUsize,
    bypass: AtomicBool,
    external_hint: AtomicBool,
    external: RwLock<Option<Arc<dyn ExternalSource>>>,

    debug: bool,
}

impl std::fmt::Debug for EncodedGradientAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedGradientAccumulator")
            .field("parties", &self.parties)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl EncodedGradientAccumulator {
    pub fn new(config: AccumulatorConfig, affinity: Arc<dyn AffinityProvider>) -> Result<Self> {
        config.validate()?;

        // Single-device systems (cpu, or one gpu hosting several workers)
        // are the accepted edge case; otherwise a channel must live on the
        // device of the worker that drains it.
        let devices = affinity.device_count();
        if config.parties > devices && devices != 1 {
            return Err(GradSyncError::config(format!(
                "number of parties [{}] should be less or equal to number of devices [{}]",
                config.parties, devices
            )));
        }

        let slot_size = (config.initial_memory / config.queue_size as u64) as usize;
        let channels = (0..config.parties)
            .map(|_| ConsumerChannel::new(slot_size, config.queue_size))
            .collect();

        Ok(Self {
            parties: config.parties,
            handler: EncodingHandler::new(&config),
            channels,
            barrier: RendezvousBarrier::new(),
            registration: StepGate::new(),
            fault: FaultCell::new(),
            affinity,
            current_consumers: AtomicUsize::new(0),
            workers_counter: AtomicUsize::new(0),
            bypass: AtomicBool::new(false),
            external_hint: AtomicBool::new(false),
            external: RwLock::new(None),
            debug: config.debug,
        })
    }

    /// Arena bytes needed per consumer so that `num_workers` producers with
    /// `queue_size` slots each can never starve one another.
    ///
    /// Updates are bounded by the bitmap encoding's worst case of
    /// `params_len / 16` four-byte words per message, plus 64 KiB of
    /// headroom.
    pub fn optimal_buffer_size(params_len: u64, num_workers: u32, queue_size: u32) -> u64 {
        ((params_len / 16) + 65536) * num_workers as u64 * queue_size as u64 * 4
    }

    /// Number of registered worker slots.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Assign the calling worker its stable consumer index.
    ///
    /// With multiple devices each worker binds to its device's channel;
    /// on single-device systems workers take the next unused flat index.
    pub fn touch(&self) -> Result<WorkerContext> {
        let index = if self.affinity.device_count() > 1 && self.parties > 1 {
            self.affinity.current_device()
        } else {
            self.workers_counter.fetch_add(1, Ordering::AcqRel)
        };
        if index >= self.parties {
            return Err(GradSyncError::config(format!(
                "worker index [{index}] exceeds configured parties [{}]",
                self.parties
            )));
        }
        Ok(WorkerContext {
            index,
            residual: None,
            last_stats: None,
            updates_applied: 0,
        })
    }

    /// Declare how many workers participate in the current step.
    ///
    /// Blocks until the previous step's registration has been consumed
    /// (its final barrier released), so two steps can never overlap their
    /// consumer counts.
    pub fn register_consumers(&self, num_consumers: usize) -> Result<()> {
        let result = self.register_consumers_inner(num_consumers);
        if let Err(e) = &result {
            self.fault.set_if_first(e);
        }
        result
    }

    fn register_consumers_inner(&self, num_consumers: usize) -> Result<()> {
        if self.registration.is_open()? {
            if self.debug {
                tracing::debug!("master thread waiting for previous registration to clear");
            }
            self.registration.wait_closed(&self.fault)?;
        }

        if let Some(source) = self.external_source()? {
            source.register_consumers(num_consumers);
        }

        self.current_consumers.store(num_consumers, Ordering::Release);
        self.registration.open()
    }

    /// Accept a local delta, fold it into this worker's residual, encode,
    /// and broadcast to every consumer, then rendezvous with the step's
    /// other producers.
    pub fn store_update(
        &self,
        ctx: &mut WorkerContext,
        delta: &[f32],
        iteration: u64,
        epoch: u64,
    ) -> Result<()> {
        let result = self.store_update_inner(ctx, delta, iteration, epoch);
        if let Err(e) = &result {
            self.fault.set_if_first(e);
        }
        result
    }

    fn store_update_inner(
        &self,
        ctx: &mut WorkerContext,
        delta: &[f32],
        iteration: u64,
        epoch: u64,
    ) -> Result<()> {
        // Lazily allocated on the plain heap: the residual must outlive
        // every per-step arena slot.
        let residual = match &mut ctx.residual {
            Some(r) => {
                if r.len() != delta.len() {
                    return Err(GradSyncError::SizeMismatch {
                        expected: r.len(),
                        actual: delta.len(),
                    });
                }
                r
            }
            slot @ None => slot.insert(vec![0.0f32; delta.len()]),
        };
        for (r, d) in residual.iter_mut().zip(delta) {
            *r += d;
        }

        // Block until the harness declares this step's consumer count.
        if !self.bypass.load(Ordering::Acquire) {
            if self.debug {
                tracing::debug!(worker = ctx.index, "waiting at registration gate");
            }
            self.registration.wait_open(&self.fault)?;
        }

        if let Some(message) = self
            .handler
            .encode_update(residual, &mut ctx.last_stats, iteration, epoch)
        {
            self.replicate_inner(&message)?;
        }

        self.synchronize(self.current_consumers.load(Ordering::Acquire), false)
    }

    /// Replicate an already-encoded update into every consumer's channel.
    ///
    /// This is also the ingest point for updates arriving from outside the
    /// process (a transport layer decodes frames and hands them here).
    pub fn replicate(&self, message: &[u8]) -> Result<()> {
        let result = self.replicate_inner(message);
        if let Err(e) = &result {
            self.fault.set_if_first(e);
        }
        result
    }

    fn replicate_inner(&self, message: &[u8]) -> Result<()> {
        // Compressed messages are replicated as-is; decoding stays local to
        // each consumer. The per-channel lock inside `put` keeps each
        // arena single-writer.
        for channel in &self.channels {
            channel.put(message, &self.fault)?;
        }
        Ok(())
    }

    /// Drain this worker's channel, decode and sum every pending update
    /// (plus any external-source contribution), and on the step's final
    /// call rendezvous before invoking `step_fn` once.
    pub fn apply_update(
        &self,
        ctx: &mut WorkerContext,
        step_fn: &dyn StepFunction,
        params: &mut [f32],
        updates: &mut [f32],
        final_step: bool,
    ) -> Result<()> {
        let result = self.apply_update_inner(ctx, step_fn, params, updates, final_step, None);
        if let Err(e) = &result {
            self.fault.set_if_first(e);
        }
        result
    }

    /// [`apply_update`](Self::apply_update) variant passing an explicit
    /// scaling factor to the step function; always treated as the step's
    /// final call.
    pub fn apply_update_with_alpha(
        &self,
        ctx: &mut WorkerContext,
        step_fn: &dyn StepFunction,
        params: &mut [f32],
        updates: &mut [f32],
        alpha: f64,
    ) -> Result<()> {
        let result = self.apply_update_inner(ctx, step_fn, params, updates, true, Some(alpha));
        if let Err(e) = &result {
            self.fault.set_if_first(e);
        }
        result
    }

    fn apply_update_inner(
        &self,
        ctx: &mut WorkerContext,
        step_fn: &dyn StepFunction,
        params: &mut [f32],
        updates: &mut [f32],
        final_step: bool,
        alpha: Option<f64>,
    ) -> Result<()> {
        updates.fill(0.0);

        let mut applied = 0usize;
        for message in self.channels[ctx.index].drain()? {
            decode_into(&message, updates)?;
            applied += 1;
        }
        if applied > 0 && self.debug {
            tracing::debug!(worker = ctx.index, applied, "local updates to be applied");
        }

        if let Some(source) = self.external_source()? {
            if source.has_anything() {
                source.drain_to(updates)?;
                self.external_hint.store(false, Ordering::Release);
                applied += 1;
                if self.debug {
                    tracing::debug!(worker = ctx.index, "external updates folded in");
                }
            }
        }

        // The rendezvous comes before the step function so every worker
        // observes a fully drained state boundary; the updates buffer
        // itself is private to the calling thread.
        if final_step {
            self.synchronize(self.current_consumers.load(Ordering::Acquire), true)?;
        }

        if applied > 0 {
            match alpha {
                Some(a) => step_fn.step_with_alpha(params, updates, a),
                None => step_fn.step(params, updates),
            }
            ctx.updates_applied += applied as u64;
        }
        Ok(())
    }

    fn synchronize(&self, consumers: usize, final_lock: bool) -> Result<()> {
        if consumers <= 1 || self.bypass.load(Ordering::Acquire) {
            if final_lock {
                self.registration.close()?;
            }
            return Ok(());
        }

        if self.debug {
            tracing::debug!(
                thread = ?std::thread::current().id(),
                consumers,
                final_lock,
                "entering rendezvous"
            );
        }
        if final_lock {
            // Reopening registration happens inside the release, before any
            // waiter resumes: the next step cannot start against a half-
            // released barrier. A failure to close the gate is a real
            // fault: the releasing thread returns it and peers see the cell.
            let mut gate_result = Ok(());
            self.barrier.wait(consumers, &self.fault, || {
                gate_result = self.registration.close();
                if let Err(e) = &gate_result {
                    self.fault.set_if_first(e);
                }
            })?;
            gate_result
        } else {
            self.barrier.wait(consumers, &self.fault, || {})
        }
    }

    /// Attach a secondary update source folded into every apply step.
    pub fn set_external_source(&self, source: Arc<dyn ExternalSource>) -> Result<()> {
        *self
            .external
            .write()
            .map_err(|_| GradSyncError::LockPoisoned("external source"))? = Some(source);
        Ok(())
    }

    /// The currently attached external source, if any.
    pub fn external_source(&self) -> Result<Option<Arc<dyn ExternalSource>>> {
        Ok(self
            .external
            .read()
            .map_err(|_| GradSyncError::LockPoisoned("external source"))?
            .clone())
    }

    /// Early-availability hint from the transport layer: external updates
    /// are on the way even if the source has not surfaced them yet.
    pub fn mark_external_updates(&self, updates_available: bool) {
        self.external_hint
            .store(updates_available, Ordering::Release);
    }

    /// True if external updates are pending (or hinted as pending).
    pub fn has_anything(&self) -> Result<bool> {
        if self.external_hint.load(Ordering::Acquire) {
            return Ok(true);
        }
        Ok(self
            .external_source()?
            .map(|s| s.has_anything())
            .unwrap_or(false))
    }

    /// Skip all cross-thread synchronization: with a single consumer there
    /// is nothing to rendezvous with.
    pub fn fallback_to_single_consumer(&self, enable: bool) -> Result<()> {
        if let Some(source) = self.external_source()? {
            source.fallback_to_single_consumer(enable);
        }
        self.bypass.store(enable, Ordering::Release);
        Ok(())
    }

    /// Discard all accumulated state: every channel is drained, index
    /// assignment restarts from zero, and the fault cell is cleared.
    ///
    /// Must only be called between steps (no thread mid-barrier);
    /// outstanding [`WorkerContext`]s become stale and their owners must
    /// `touch()` again.
    pub fn reset(&self) -> Result<()> {
        for channel in &self.channels {
            channel.clear()?;
        }
        self.workers_counter.store(0, Ordering::Release);
        self.current_consumers.store(0, Ordering::Release);
        self.registration.close()?;
        self.external_hint.store(false, Ordering::Release);
        self.fault.reset();
        Ok(())
    }
}
