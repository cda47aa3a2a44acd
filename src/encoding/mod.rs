pub mod encoder;
pub mod message;
pub mod residual;
pub mod threshold;

pub use encoder::{EncodeOutcome, encode, encode_dense};
pub use message::{HEADER_SIZE, MessageHeader, decode_into, read_header, validate};
pub use residual::{ResidualClippingPostProcessor, ResidualPostProcessor};
pub use threshold::{AdaptiveThreshold, FixedThreshold, StepStats, ThresholdAlgorithm};
