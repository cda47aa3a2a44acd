//! Threshold encoder: dense residual -> sparse wire message.

use super::message::{self, BITMAP_MINUS, BITMAP_NONE, BITMAP_PLUS};

/// One `SparseIndexed` entry costs 8 bytes (64 bits); one bitmap element
/// costs 2 bits. Bitmap wins once more than `count / 32` elements qualify.
const BITMAP_CROSSOVER_DIVISOR: usize = 32;

/// Result of encoding one residual buffer.
pub struct EncodeOutcome {
    /// Wire message, ready to replicate.
    pub bytes: Vec<u8>,
    /// Number of elements transmitted.
    pub encoded: usize,
}

impl EncodeOutcome {
    /// Fraction of elements transmitted, for threshold adaptation.
    pub fn sparsity(&self, count: usize) -> f64 {
        if count == 0 {
            0.0
        } else {
            self.encoded as f64 / count as f64
        }
    }
}

/// Encode every element of `residual` with `|v| >= threshold`, subtracting
/// the emitted quantity in place so the remainder carries to the next step.
///
/// Encoding selection:
/// - `SparseIndexed` transmits exact values (the emitted positions become
///   zero residual). Chosen while the qualifying count stays below the
///   bitmap crossover, and always when `max_elements` caps the message.
/// - `SparseBitmap` transmits `sign * threshold` per qualifying element
///   (the remainder above threshold stays in the residual). Chosen once
///   indexed per-entry overhead exceeds the 2-bit bitmap cost.
///
/// Returns `None` when nothing is above threshold; nothing is broadcast
/// that step and the whole residual is retried next time.
pub fn encode(residual: &mut [f32], threshold: f32, max_elements: usize) -> Option<EncodeOutcome> {
    let count = residual.len();
    let qualifying = residual.iter().filter(|v| v.abs() >= threshold).count();
    if qualifying == 0 {
        return None;
    }

    let cap = max_elements.max(1);
    let capped = qualifying.min(cap);
    let use_bitmap = capped == qualifying && qualifying > count / BITMAP_CROSSOVER_DIVISOR;

    if use_bitmap {
        let mut codes = vec![BITMAP_NONE; count];
        for (i, v) in residual.iter_mut().enumerate() {
            if *v >= threshold {
                codes[i] = BITMAP_PLUS;
                *v -= threshold;
            } else if *v <= -threshold {
                codes[i] = BITMAP_MINUS;
                *v += threshold;
            }
        }
        Some(EncodeOutcome {
            bytes: message::build_bitmap(&codes, threshold),
            encoded: qualifying,
        })
    } else {
        let mut pairs = Vec::with_capacity(capped);
        for (i, v) in residual.iter_mut().enumerate() {
            if v.abs() >= threshold {
                pairs.push((i as u32, *v));
                *v = 0.0;
                if pairs.len() == capped {
                    break;
                }
            }
        }
        Some(EncodeOutcome {
            bytes: message::build_indexed(count, threshold, &pairs),
            encoded: pairs.len(),
        })
    }
}

/// Encode `values` losslessly as a `Dense` message.
///
/// Used to inject already-combined updates (external sources, tests); the
/// hot path always goes through [`encode`].
pub fn encode_dense(values: &[f32], threshold: f32) -> Vec<u8> {
    message::build_dense(values, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::message::{decode_into, read_header};
    use crate::types::EncodingKind;

    #[test]
    fn test_nothing_above_threshold() {
        let mut residual = vec![0.01f32, -0.02, 0.03];
        assert!(encode(&mut residual, 0.1, usize::MAX).is_none());
        // Residual untouched, retried next step.
        assert_eq!(residual, vec![0.01, -0.02, 0.03]);
    }

    #[test]
    fn test_indexed_chosen_when_sparse() {
        // 2 of 100 qualify: well below the crossover (100 / 32 = 3).
        let mut residual = vec![0.0f32; 100];
        residual[10] = 0.5;
        residual[90] = -0.7;

        let out = encode(&mut residual, 0.1, usize::MAX).unwrap();
        assert_eq!(out.encoded, 2);
        assert_eq!(
            read_header(&out.bytes).unwrap().kind,
            EncodingKind::SparseIndexed
        );

        // Exact values transmitted, emitted positions zeroed.
        assert_eq!(residual[10], 0.0);
        assert_eq!(residual[90], 0.0);

        let mut dest = vec![0.0f32; 100];
        decode_into(&out.bytes, &mut dest).unwrap();
        assert_eq!(dest[10], 0.5);
        assert_eq!(dest[90], -0.7);
    }

    #[test]
    fn test_bitmap_chosen_when_dense() {
        // Every element qualifies: far past the crossover.
        let mut residual = vec![0.5f32; 64];
        residual[3] = -0.5;

        let out = encode(&mut residual, 0.1, usize::MAX).unwrap();
        assert_eq!(out.encoded, 64);
        assert_eq!(
            read_header(&out.bytes).unwrap().kind,
            EncodingKind::SparseBitmap
        );

        // Bitmap emits sign * threshold, remainder stays as residual.
        assert!((residual[0] - 0.4).abs() < 1e-6);
        assert!((residual[3] + 0.4).abs() < 1e-6);

        let mut dest = vec![0.0f32; 64];
        decode_into(&out.bytes, &mut dest).unwrap();
        assert!((dest[0] - 0.1).abs() < 1e-6);
        assert!((dest[3] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_roundtrip_error_within_threshold() {
        // Round-trip property: for encoded elements the reconstruction is
        // within threshold; unencoded elements keep their exact residual.
        let threshold = 0.1f32;
        let original: Vec<f32> = (0..256)
            .map(|i| ((i as f32 * 37.0).sin()) * 0.3)
            .collect();
        let mut residual = original.clone();

        let out = encode(&mut residual, threshold, usize::MAX).unwrap();
        let mut dest = vec![0.0f32; 256];
        decode_into(&out.bytes, &mut dest).unwrap();

        for i in 0..256 {
            // decoded + residual reconstructs the original exactly for
            // indexed; within float rounding for bitmap.
            assert!(
                (dest[i] + residual[i] - original[i]).abs() < 1e-5,
                "element {i} not conserved"
            );
            if original[i].abs() >= threshold {
                assert!(
                    (dest[i] - original[i]).abs() <= threshold + 1e-6,
                    "encoded element {i} off by more than threshold"
                );
            } else {
                assert_eq!(dest[i], 0.0);
                assert_eq!(residual[i], original[i]);
            }
        }
    }

    #[test]
    fn test_max_elements_cap_forces_indexed() {
        // All 64 qualify, but the cap keeps only 8 -> indexed even though
        // the density is past the bitmap crossover.
        let mut residual = vec![1.0f32; 64];
        let out = encode(&mut residual, 0.1, 8).unwrap();
        assert_eq!(out.encoded, 8);
        assert_eq!(
            read_header(&out.bytes).unwrap().kind,
            EncodingKind::SparseIndexed
        );
        // 8 emitted exactly, 56 untouched.
        assert_eq!(residual.iter().filter(|v| **v == 0.0).count(), 8);
        assert_eq!(residual.iter().filter(|v| **v == 1.0).count(), 56);
    }

    #[test]
    fn test_sparsity() {
        let mut residual = vec![0.0f32; 100];
        residual[0] = 1.0;
        let out = encode(&mut residual, 0.1, usize::MAX).unwrap();
        assert!((out.sparsity(100) - 0.01).abs() < 1e-12);
    }
}
