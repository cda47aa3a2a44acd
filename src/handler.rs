//! Encoding handler: glues threshold selection, the encoder, and residual
//! post-processing into one per-step operation on a worker's residual.

use crate::config::AccumulatorConfig;
use crate::encoding;
use crate::encoding::residual::ResidualPostProcessor;
use crate::encoding::threshold::{StepStats, ThresholdAlgorithm};
use std::sync::Arc;

pub struct EncodingHandler {
    threshold_algorithm: Arc<dyn ThresholdAlgorithm>,
    residual_post_processor: Option<Arc<dyn ResidualPostProcessor>>,
    boundary: f64,
    encoding_debug: bool,
}

impl EncodingHandler {
    pub fn new(config: &AccumulatorConfig) -> Self {
        Self {
            threshold_algorithm: Arc::clone(&config.threshold_algorithm),
            residual_post_processor: config.residual_post_processor.clone(),
            boundary: config.boundary,
            encoding_debug: config.encoding_debug,
        }
    }

    /// Encode one step's worth of `residual` into a wire message.
    ///
    /// `last_stats` is the calling worker's feedback channel into the
    /// threshold algorithm; it is updated in place. Returns `None` when
    /// nothing crossed the threshold (nothing is broadcast that step).
    pub fn encode_update(
        &self,
        residual: &mut [f32],
        last_stats: &mut Option<StepStats>,
        iteration: u64,
        epoch: u64,
    ) -> Option<Vec<u8>> {
        let threshold = self.threshold_algorithm.next_threshold(*last_stats);
        let count = residual.len();
        let max_elements = if self.boundary >= 1.0 {
            usize::MAX
        } else {
            ((count as f64 * self.boundary).ceil() as usize).max(1)
        };

        let outcome = encoding::encode(residual, threshold, max_elements);
        let sparsity = outcome
            .as_ref()
            .map(|o| o.sparsity(count))
            .unwrap_or(0.0);
        *last_stats = Some(StepStats {
            threshold,
            sparsity,
        });

        if let Some(pp) = &self.residual_post_processor {
            pp.process(iteration, threshold, residual);
        }

        if self.encoding_debug {
            let bytes = outcome.as_ref().map(|o| o.bytes.len()).unwrap_or(0);
            tracing::debug!(
                iteration,
                epoch,
                threshold,
                sparsity,
                bytes,
                "encoded step update"
            );
        }

        outcome.map(|o| o.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::FixedThreshold;
    use crate::encoding::message::{decode_into, read_header};
    use crate::types::EncodingKind;

    fn handler_with(boundary: f64) -> EncodingHandler {
        let mut cfg = AccumulatorConfig::new(1);
        cfg.threshold_algorithm = Arc::new(FixedThreshold(0.1));
        cfg.boundary = boundary;
        EncodingHandler::new(&cfg)
    }

    #[test]
    fn test_encode_below_threshold_yields_nothing() {
        let handler = handler_with(1.0);
        let mut residual = vec![0.01f32; 8];
        let mut stats = None;
        assert!(handler.encode_update(&mut residual, &mut stats, 1, 0).is_none());
        // Stats still recorded for the threshold algorithm.
        assert_eq!(stats.unwrap().sparsity, 0.0);
    }

    #[test]
    fn test_encode_produces_decodable_message() {
        let handler = handler_with(1.0);
        let mut residual = vec![0.0f32; 64];
        residual[5] = 0.5;
        let mut stats = None;

        let msg = handler
            .encode_update(&mut residual, &mut stats, 1, 0)
            .unwrap();
        let mut dest = vec![0.0f32; 64];
        decode_into(&msg, &mut dest).unwrap();
        assert_eq!(dest[5], 0.5);
        assert!(stats.unwrap().sparsity > 0.0);
    }

    #[test]
    fn test_boundary_caps_message() {
        let handler = handler_with(0.25);
        let mut residual = vec![1.0f32; 16];
        let mut stats = None;

        let msg = handler
            .encode_update(&mut residual, &mut stats, 1, 0)
            .unwrap();
        // Cap of 4 elements forces the indexed encoding.
        assert_eq!(
            read_header(&msg).unwrap().kind,
            EncodingKind::SparseIndexed
        );
        assert_eq!(residual.iter().filter(|v| **v == 0.0).count(), 4);
    }

    #[test]
    fn test_residual_post_processing_applies() {
        let mut cfg = AccumulatorConfig::new(1);
        cfg.threshold_algorithm = Arc::new(FixedThreshold(0.1));
        cfg.residual_post_processor = Some(Arc::new(
            crate::encoding::ResidualClippingPostProcessor::new(2.0, 1),
        ));
        let handler = EncodingHandler::new(&cfg);

        // One huge sub-threshold-free element: bitmap emits 0.1, the rest
        // would stay as residual 9.9, then clipping bounds it to 0.2.
        let mut residual = vec![10.0f32];
        let mut stats = None;
        handler.encode_update(&mut residual, &mut stats, 1, 0).unwrap();
        assert!((residual[0] - 0.2).abs() < 1e-6);
    }
}
