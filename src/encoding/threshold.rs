//! Threshold selection algorithms.

use crate::error::{GradSyncError, Result};

/// Encoding statistics of a worker's previous step, fed back into the
/// threshold algorithm.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    /// Threshold used on the previous step.
    pub threshold: f32,
    /// Fraction of elements that were transmitted.
    pub sparsity: f64,
}

/// Produces the encoding threshold for each step.
///
/// Implementations are shared across workers and must not carry per-worker
/// state; per-worker feedback arrives via `last`.
pub trait ThresholdAlgorithm: Send + Sync {
    fn next_threshold(&self, last: Option<StepStats>) -> f32;
}

/// Constant threshold, no adaptation.
#[derive(Debug, Clone, Copy)]
pub struct FixedThreshold(pub f32);

impl ThresholdAlgorithm for FixedThreshold {
    fn next_threshold(&self, _last: Option<StepStats>) -> f32 {
        self.0
    }
}

/// Adapts the threshold to keep the transmitted fraction inside a target
/// sparsity band.
///
/// When the previous step transmitted fewer than `min_sparsity` of the
/// elements, the threshold shrinks by `decay_rate` so more gradient gets
/// through; above `max_sparsity` it grows to cut bandwidth.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveThreshold {
    initial: f32,
    min_sparsity: f64,
    max_sparsity: f64,
    decay_rate: f32,
}

impl AdaptiveThreshold {
    /// Default band `[1e-4, 1e-2]` with a 2% adjustment step.
    pub fn with_initial(initial: f32) -> Self {
        Self {
            initial,
            min_sparsity: 1e-4,
            max_sparsity: 1e-2,
            decay_rate: 1.02,
        }
    }

    pub fn new(
        initial: f32,
        min_sparsity: f64,
        max_sparsity: f64,
        decay_rate: f32,
    ) -> Result<Self> {
        if initial <= 0.0 {
            return Err(GradSyncError::config("initial threshold must be positive"));
        }
        if !(min_sparsity > 0.0 && min_sparsity < max_sparsity && max_sparsity <= 1.0) {
            return Err(GradSyncError::config(format!(
                "sparsity band must satisfy 0 < min < max <= 1, got [{min_sparsity}, {max_sparsity}]"
            )));
        }
        if decay_rate <= 1.0 {
            return Err(GradSyncError::config("decay rate must be greater than 1"));
        }
        Ok(Self {
            initial,
            min_sparsity,
            max_sparsity,
            decay_rate,
        })
    }
}

impl ThresholdAlgorithm for AdaptiveThreshold {
    fn next_threshold(&self, last: Option<StepStats>) -> f32 {
        let Some(stats) = last else {
            return self.initial;
        };
        if stats.sparsity < self.min_sparsity {
            stats.threshold / self.decay_rate
        } else if stats.sparsity > self.max_sparsity {
            stats.threshold * self.decay_rate
        } else {
            stats.threshold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_ignores_feedback() {
        let algo = FixedThreshold(1e-3);
        assert_eq!(algo.next_threshold(None), 1e-3);
        assert_eq!(
            algo.next_threshold(Some(StepStats {
                threshold: 0.5,
                sparsity: 0.9,
            })),
            1e-3
        );
    }

    #[test]
    fn test_adaptive_first_step_uses_initial() {
        let algo = AdaptiveThreshold::with_initial(1e-3);
        assert_eq!(algo.next_threshold(None), 1e-3);
    }

    #[test]
    fn test_adaptive_shrinks_when_too_sparse() {
        let algo = AdaptiveThreshold::with_initial(1e-3);
        let next = algo.next_threshold(Some(StepStats {
            threshold: 1e-3,
            sparsity: 0.0,
        }));
        assert!(next < 1e-3);
    }

    #[test]
    fn test_adaptive_grows_when_too_dense() {
        let algo = AdaptiveThreshold::with_initial(1e-3);
        let next = algo.next_threshold(Some(StepStats {
            threshold: 1e-3,
            sparsity: 0.5,
        }));
        assert!(next > 1e-3);
    }

    #[test]
    fn test_adaptive_holds_inside_band() {
        let algo = AdaptiveThreshold::with_initial(1e-3);
        let next = algo.next_threshold(Some(StepStats {
            threshold: 2e-3,
            sparsity: 1e-3,
        }));
        assert_eq!(next, 2e-3);
    }

    #[test]
    fn test_adaptive_validation() {
        assert!(AdaptiveThreshold::new(0.0, 1e-4, 1e-2, 1.02).is_err());
        assert!(AdaptiveThreshold::new(1e-3, 1e-2, 1e-4, 1.02).is_err());
        assert!(AdaptiveThreshold::new(1e-3, 1e-4, 1e-2, 0.9).is_err());
        assert!(AdaptiveThreshold::new(1e-3, 1e-4, 1e-2, 1.02).is_ok());
    }
}
