use crate::error::{GradSyncError, Result};

/// Stable index of a worker within an accumulator (0-indexed).
pub type WorkerIndex = usize;

/// How an update message is encoded on the wire.
///
/// The discriminant is the fixed-position header value of an encoded
/// message; it must never change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EncodingKind {
    /// Exact values for every element.
    Dense = 0,
    /// Explicit `(index, value)` pairs for elements above threshold.
    SparseIndexed = 1,
    /// Packed 2-bit codes (none / +threshold / -threshold) per element.
    SparseBitmap = 2,
}

impl EncodingKind {
    /// Parse a wire header value, rejecting anything foreign.
    pub fn from_header(header: i32) -> Result<Self> {
        match header {
            0 => Ok(EncodingKind::Dense),
            1 => Ok(EncodingKind::SparseIndexed),
            2 => Ok(EncodingKind::SparseBitmap),
            other => Err(GradSyncError::UnknownEncoding { header: other }),
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            EncodingKind::Dense => "dense",
            EncodingKind::SparseIndexed => "sparse-indexed",
            EncodingKind::SparseBitmap => "sparse-bitmap",
        }
    }
}

impl std::fmt::Display for EncodingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Externally supplied optimizer update rule.
///
/// Called once per worker per step with the combined update buffer.
/// `params` and `updates` are owned by the caller and must not be retained
/// beyond the call.
pub trait StepFunction: Send + Sync {
    fn step(&self, params: &mut [f32], updates: &[f32]);

    /// Step with an explicit scaling factor. Default scales `updates` by
    /// `alpha` before delegating to [`StepFunction::step`] semantics.
    fn step_with_alpha(&self, params: &mut [f32], updates: &[f32], alpha: f64) {
        let scaled: Vec<f32> = updates.iter().map(|u| u * alpha as f32).collect();
        self.step(params, &scaled);
    }
}

/// Stock step function: subtract the accumulated update from the parameters.
pub struct NegativeGradientStep;

impl StepFunction for NegativeGradientStep {
    fn step(&self, params: &mut [f32], updates: &[f32]) {
        for (p, u) in params.iter_mut().zip(updates) {
            *p -= u;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_kind_roundtrip() {
        for kind in [
            EncodingKind::Dense,
            EncodingKind::SparseIndexed,
            EncodingKind::SparseBitmap,
        ] {
            assert_eq!(EncodingKind::from_header(kind as i32).unwrap(), kind);
        }
    }

    #[test]
    fn test_encoding_kind_rejects_foreign_header() {
        let err = EncodingKind::from_header(42).unwrap_err();
        assert!(matches!(
            err,
            GradSyncError::UnknownEncoding { header: 42 }
        ));
    }

    #[test]
    fn test_encoding_kind_display() {
        assert_eq!(EncodingKind::Dense.to_string(), "dense");
        assert_eq!(EncodingKind::SparseBitmap.to_string(), "sparse-bitmap");
    }

    #[test]
    fn test_negative_gradient_step() {
        let mut params = vec![1.0f32, 2.0, 3.0];
        NegativeGradientStep.step(&mut params, &[0.5, 0.5, 0.5]);
        assert_eq!(params, vec![0.5, 1.5, 2.5]);
    }

    #[test]
    fn test_step_with_alpha_scales() {
        let mut params = vec![1.0f32, 1.0];
        NegativeGradientStep.step_with_alpha(&mut params, &[1.0, 2.0], 0.5);
        assert_eq!(params, vec![0.5, 0.0]);
    }
}
