//! Accumulator construction parameters.
//!
//! All tuning fields have sensible defaults. Override them directly on the
//! struct or via environment variables (prefixed `GRADSYNC_`).

use crate::encoding::residual::{ResidualClippingPostProcessor, ResidualPostProcessor};
use crate::encoding::threshold::{AdaptiveThreshold, ThresholdAlgorithm};
use crate::error::{GradSyncError, Result};
use std::sync::Arc;

/// Default arena memory per consumer channel: 100 MiB.
pub const DEFAULT_INITIAL_MEMORY: u64 = 100 * 1024 * 1024;

/// Default number of queue slots per consumer channel.
pub const DEFAULT_QUEUE_SIZE: usize = 5;

/// Configuration for [`EncodedGradientAccumulator`](crate::EncodedGradientAccumulator).
#[derive(Clone)]
pub struct AccumulatorConfig {
    /// Number of worker threads that will register with the accumulator.
    pub parties: usize,

    /// Produces the encoding threshold for each step.
    pub threshold_algorithm: Arc<dyn ThresholdAlgorithm>,

    /// Bounds the carried-over residual; `None` lets it drift unbounded.
    pub residual_post_processor: Option<Arc<dyn ResidualPostProcessor>>,

    /// Arena memory dedicated to each consumer channel, in bytes. Split
    /// evenly into `queue_size` slots; one encoded message must fit a slot.
    pub initial_memory: u64,

    /// Bounded queue capacity per consumer channel.
    pub queue_size: usize,

    /// Upper bound on the fraction of elements encoded per message, in
    /// `(0.0, 1.0]`. `1.0` means no limit.
    pub boundary: f64,

    /// Log per-step encoding statistics (threshold, sparsity, bytes).
    pub encoding_debug: bool,

    /// Log barrier and gate transitions per thread.
    pub debug: bool,
}

impl AccumulatorConfig {
    /// Configuration with default tuning for `parties` workers: adaptive
    /// threshold starting at `1e-4` and residual clipping at 5x threshold
    /// every 5 steps.
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            threshold_algorithm: Arc::new(AdaptiveThreshold::with_initial(1e-4)),
            residual_post_processor: Some(Arc::new(ResidualClippingPostProcessor::new(5.0, 5))),
            initial_memory: DEFAULT_INITIAL_MEMORY,
            queue_size: DEFAULT_QUEUE_SIZE,
            boundary: 1.0,
            encoding_debug: false,
            debug: false,
        }
    }

    /// Apply `GRADSYNC_*` environment overrides to the tuning fields.
    ///
    /// Recognized variables:
    /// - `GRADSYNC_INITIAL_MEMORY` (bytes)
    /// - `GRADSYNC_QUEUE_SIZE`
    /// - `GRADSYNC_DEBUG` (`1` enables both debug flags)
    pub fn from_env(parties: usize) -> Self {
        let mut cfg = Self::new(parties);

        if let Ok(v) = std::env::var("GRADSYNC_INITIAL_MEMORY")
            && let Ok(n) = v.parse::<u64>()
        {
            tracing::debug!(initial_memory = n, "environment override");
            cfg.initial_memory = n;
        }
        if let Ok(v) = std::env::var("GRADSYNC_QUEUE_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            tracing::debug!(queue_size = n, "environment override");
            cfg.queue_size = n;
        }
        if let Ok(v) = std::env::var("GRADSYNC_DEBUG") {
            let on = v == "1";
            cfg.debug = on;
            cfg.encoding_debug = on;
        }

        cfg
    }

    /// Reject configurations the accumulator cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.parties < 1 {
            return Err(GradSyncError::config(
                "number of parties should be a positive value",
            ));
        }
        if self.queue_size < 1 {
            return Err(GradSyncError::config(
                "queue size should be a positive value",
            ));
        }
        if self.initial_memory / self.queue_size as u64 == 0 {
            return Err(GradSyncError::config(format!(
                "initial memory of {} bytes yields empty arena slots for queue size {}",
                self.initial_memory, self.queue_size
            )));
        }
        if !(self.boundary > 0.0 && self.boundary <= 1.0) {
            return Err(GradSyncError::config(format!(
                "boundary should be in (0.0, 1.0], got {}",
                self.boundary
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AccumulatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccumulatorConfig")
            .field("parties", &self.parties)
            .field("initial_memory", &self.initial_memory)
            .field("queue_size", &self.queue_size)
            .field("boundary", &self.boundary)
            .field("encoding_debug", &self.encoding_debug)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AccumulatorConfig::new(4).validate().is_ok());
    }

    #[test]
    fn test_zero_parties_rejected() {
        let err = AccumulatorConfig::new(0).validate().unwrap_err();
        assert!(matches!(err, GradSyncError::InvalidConfig { .. }));
    }

    #[test]
    fn test_zero_queue_size_rejected() {
        let mut cfg = AccumulatorConfig::new(2);
        cfg.queue_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_boundary_rejected() {
        let mut cfg = AccumulatorConfig::new(2);
        cfg.boundary = 0.0;
        assert!(cfg.validate().is_err());
        cfg.boundary = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tiny_memory_rejected() {
        let mut cfg = AccumulatorConfig::new(2);
        cfg.initial_memory = 3;
        cfg.queue_size = 5;
        assert!(cfg.validate().is_err());
    }
}
