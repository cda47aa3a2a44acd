//! Threshold-encoded gradient accumulation and synchronization for
//! multi-worker training.
//!
//! One worker thread per local compute device computes a local gradient
//! delta each step; the accumulator compresses it with threshold encoding,
//! fans the message out to every registered consumer through bounded
//! per-consumer channels, and rendezvouses all workers so each applies one
//! consistent combined update through the caller's step function. Errors in
//! any worker propagate to every blocked peer instead of wedging the step.

pub mod accumulator;
pub mod affinity;
pub mod barrier;
pub mod channel;
pub mod config;
pub mod encoding;
pub mod error;
pub mod external;
pub mod fault;
pub mod handler;
pub mod types;

pub use accumulator::{EncodedGradientAccumulator, WorkerContext};
pub use affinity::{AffinityProvider, UniformAffinity};
pub use barrier::{RendezvousBarrier, StepGate};
pub use channel::{ArenaPool, ArenaSlot, ConsumerChannel};
pub use config::{AccumulatorConfig, DEFAULT_INITIAL_MEMORY, DEFAULT_QUEUE_SIZE};
pub use encoding::{
    AdaptiveThreshold, FixedThreshold, ResidualClippingPostProcessor, ResidualPostProcessor,
    StepStats, ThresholdAlgorithm,
};
pub use error::{GradSyncError, Result};
pub use external::{ExternalSource, IndexedSource};
pub use fault::FaultCell;
pub use types::{EncodingKind, NegativeGradientStep, StepFunction, WorkerIndex};
