//! Wire format for encoded update messages.
//!
//! Every message starts with a fixed-position header:
//!
//! ```text
//! [kind: i32 LE][threshold: f32 LE][count: u32 LE][payload...]
//! ```
//!
//! where `count` is the element count of the original dense tensor and
//! `payload` depends on the kind:
//! - `Dense`: `count` f32 values.
//! - `SparseIndexed`: `[pairs: u32 LE]` then `pairs x (index: i32 LE, value: f32 LE)`.
//! - `SparseBitmap`: `ceil(count / 4)` bytes of packed 2-bit codes
//!   (`00` none, `01` +threshold, `10` -threshold).
//!
//! Messages are immutable once built; decoding always *accumulates* into
//! the destination buffer, it never overwrites.

use crate::error::{GradSyncError, Result};
use crate::types::EncodingKind;

/// Bytes occupied by the fixed header.
pub const HEADER_SIZE: usize = 12;

/// Bitmap code: element not transmitted this step.
pub const BITMAP_NONE: u8 = 0b00;
/// Bitmap code: `+threshold` transmitted.
pub const BITMAP_PLUS: u8 = 0b01;
/// Bitmap code: `-threshold` transmitted.
pub const BITMAP_MINUS: u8 = 0b10;

/// Parsed view over an encoded message.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub kind: EncodingKind,
    pub threshold: f32,
    pub count: usize,
}

/// Parse and validate the fixed header of `bytes`.
pub fn read_header(bytes: &[u8]) -> Result<MessageHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(GradSyncError::SizeMismatch {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let kind = EncodingKind::from_header(i32::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3],
    ]))?;
    let threshold = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    Ok(MessageHeader {
        kind,
        threshold,
        count,
    })
}

fn write_header(out: &mut Vec<u8>, kind: EncodingKind, threshold: f32, count: usize) {
    out.extend_from_slice(&(kind as i32).to_le_bytes());
    out.extend_from_slice(&threshold.to_le_bytes());
    out.extend_from_slice(&(count as u32).to_le_bytes());
}

/// Build a `Dense` message carrying exact values.
pub fn build_dense(values: &[f32], threshold: f32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + values.len() * 4);
    write_header(&mut out, EncodingKind::Dense, threshold, values.len());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Build a `SparseIndexed` message from explicit `(index, value)` pairs.
pub fn build_indexed(count: usize, threshold: f32, pairs: &[(u32, f32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 4 + pairs.len() * 8);
    write_header(&mut out, EncodingKind::SparseIndexed, threshold, count);
    out.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
    for &(idx, value) in pairs {
        out.extend_from_slice(&(idx as i32).to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Build a `SparseBitmap` message from per-element 2-bit codes.
///
/// `codes[i]` must be one of [`BITMAP_NONE`], [`BITMAP_PLUS`], [`BITMAP_MINUS`].
pub fn build_bitmap(codes: &[u8], threshold: f32) -> Vec<u8> {
    let count = codes.len();
    let packed_len = count.div_ceil(4);
    let mut out = Vec::with_capacity(HEADER_SIZE + packed_len);
    write_header(&mut out, EncodingKind::SparseBitmap, threshold, count);
    let payload_start = out.len();
    out.resize(payload_start + packed_len, 0);
    for (i, &code) in codes.iter().enumerate() {
        out[payload_start + i / 4] |= (code & 0b11) << ((i % 4) * 2);
    }
    out
}

/// Structurally validate `bytes` as one complete encoded message.
///
/// Checks the header, the payload length required by the kind, and (for
/// the indexed form) that every index lies within the element count. A
/// message that passes here decodes cleanly against any destination whose
/// length matches the header's count, so callers that retain messages for
/// later consumers can reject bad frames at the boundary.
pub fn validate(bytes: &[u8]) -> Result<MessageHeader> {
    let header = read_header(bytes)?;
    let payload = &bytes[HEADER_SIZE..];

    match header.kind {
        EncodingKind::Dense => {
            if payload.len() < header.count * 4 {
                return Err(GradSyncError::SizeMismatch {
                    expected: header.count * 4,
                    actual: payload.len(),
                });
            }
        }
        EncodingKind::SparseIndexed => {
            if payload.len() < 4 {
                return Err(GradSyncError::SizeMismatch {
                    expected: 4,
                    actual: payload.len(),
                });
            }
            let pairs =
                u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            if payload.len() < 4 + pairs * 8 {
                return Err(GradSyncError::SizeMismatch {
                    expected: 4 + pairs * 8,
                    actual: payload.len(),
                });
            }
            for p in 0..pairs {
                let off = 4 + p * 8;
                let idx = i32::from_le_bytes([
                    payload[off],
                    payload[off + 1],
                    payload[off + 2],
                    payload[off + 3],
                ]) as usize;
                if idx >= header.count {
                    return Err(GradSyncError::SizeMismatch {
                        expected: idx + 1,
                        actual: header.count,
                    });
                }
            }
        }
        EncodingKind::SparseBitmap => {
            let packed_len = header.count.div_ceil(4);
            if payload.len() < packed_len {
                return Err(GradSyncError::SizeMismatch {
                    expected: packed_len,
                    actual: payload.len(),
                });
            }
        }
    }
    Ok(header)
}

/// Decode `bytes` and add the encoded deltas into `dest`.
///
/// `dest.len()` must equal the message's element count. Unknown headers fail
/// with [`GradSyncError::UnknownEncoding`]; truncated payloads, bad indices,
/// and length disagreements fail with [`GradSyncError::SizeMismatch`].
pub fn decode_into(bytes: &[u8], dest: &mut [f32]) -> Result<()> {
    let header = validate(bytes)?;
    if dest.len() != header.count {
        return Err(GradSyncError::SizeMismatch {
            expected: header.count,
            actual: dest.len(),
        });
    }
    let payload = &bytes[HEADER_SIZE..];

    match header.kind {
        EncodingKind::Dense => {
            for (i, d) in dest.iter_mut().enumerate() {
                let off = i * 4;
                *d += f32::from_le_bytes([
                    payload[off],
                    payload[off + 1],
                    payload[off + 2],
                    payload[off + 3],
                ]);
            }
        }
        EncodingKind::SparseIndexed => {
            let pairs =
                u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
            for p in 0..pairs {
                let off = 4 + p * 8;
                // Index already bounds-checked by `validate`.
                let idx = i32::from_le_bytes([
                    payload[off],
                    payload[off + 1],
                    payload[off + 2],
                    payload[off + 3],
                ]) as usize;
                let value = f32::from_le_bytes([
                    payload[off + 4],
                    payload[off + 5],
                    payload[off + 6],
                    payload[off + 7],
                ]);
                dest[idx] += value;
            }
        }
        EncodingKind::SparseBitmap => {
            for (i, d) in dest.iter_mut().enumerate() {
                let code = (payload[i / 4] >> ((i % 4) * 2)) & 0b11;
                match code {
                    BITMAP_PLUS => *d += header.threshold,
                    BITMAP_MINUS => *d -= header.threshold,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_roundtrip_accumulates() {
        let values = vec![1.0f32, -2.0, 0.5];
        let msg = build_dense(&values, 0.1);

        let mut dest = vec![1.0f32; 3];
        decode_into(&msg, &mut dest).unwrap();
        assert_eq!(dest, vec![2.0, -1.0, 1.5]);

        // Decoding twice keeps accumulating.
        decode_into(&msg, &mut dest).unwrap();
        assert_eq!(dest, vec![3.0, -3.0, 2.0]);
    }

    #[test]
    fn test_indexed_roundtrip() {
        let msg = build_indexed(6, 0.01, &[(1, 0.5), (4, -0.25)]);
        let header = read_header(&msg).unwrap();
        assert_eq!(header.kind, EncodingKind::SparseIndexed);
        assert_eq!(header.count, 6);
        assert!((header.threshold - 0.01).abs() < 1e-9);

        let mut dest = vec![0.0f32; 6];
        decode_into(&msg, &mut dest).unwrap();
        assert_eq!(dest, vec![0.0, 0.5, 0.0, 0.0, -0.25, 0.0]);
    }

    #[test]
    fn test_bitmap_roundtrip() {
        // 6 elements: +t, none, -t, none, none, +t
        let codes = [
            BITMAP_PLUS,
            BITMAP_NONE,
            BITMAP_MINUS,
            BITMAP_NONE,
            BITMAP_NONE,
            BITMAP_PLUS,
        ];
        let msg = build_bitmap(&codes, 0.5);

        let mut dest = vec![0.0f32; 6];
        decode_into(&msg, &mut dest).unwrap();
        assert_eq!(dest, vec![0.5, 0.0, -0.5, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn test_unknown_header_rejected() {
        let mut msg = build_dense(&[1.0], 0.1);
        msg[0] = 99;
        let mut dest = vec![0.0f32; 1];
        let err = decode_into(&msg, &mut dest).unwrap_err();
        assert!(matches!(err, GradSyncError::UnknownEncoding { header: 99 }));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut dest = vec![0.0f32; 1];
        assert!(matches!(
            decode_into(&[0, 0, 0], &mut dest).unwrap_err(),
            GradSyncError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_wrong_destination_length_rejected() {
        let msg = build_dense(&[1.0, 2.0], 0.1);
        let mut dest = vec![0.0f32; 3];
        let err = decode_into(&msg, &mut dest).unwrap_err();
        assert!(matches!(
            err,
            GradSyncError::SizeMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_validate_accepts_well_formed_messages() {
        assert_eq!(validate(&build_dense(&[1.0, 2.0], 0.5)).unwrap().count, 2);
        assert_eq!(
            validate(&build_indexed(8, 0.1, &[(0, 1.0), (7, -1.0)]))
                .unwrap()
                .count,
            8
        );
        assert_eq!(
            validate(&build_bitmap(&[BITMAP_PLUS, BITMAP_NONE], 0.1))
                .unwrap()
                .count,
            2
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let msg = build_indexed(4, 0.1, &[(7, 1.0)]);
        assert!(matches!(
            validate(&msg).unwrap_err(),
            GradSyncError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_validate_rejects_truncated_dense_payload() {
        let mut msg = build_dense(&[1.0, 2.0, 3.0], 0.1);
        msg.truncate(msg.len() - 2);
        assert!(matches!(
            validate(&msg).unwrap_err(),
            GradSyncError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_truncated_indexed_payload_rejected() {
        let mut msg = build_indexed(4, 0.1, &[(0, 1.0), (2, 2.0)]);
        msg.truncate(msg.len() - 3);
        let mut dest = vec![0.0f32; 4];
        assert!(matches!(
            decode_into(&msg, &mut dest).unwrap_err(),
            GradSyncError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_bitmap_partial_byte() {
        // 5 elements exercises the ragged final packed byte.
        let codes = [
            BITMAP_MINUS,
            BITMAP_NONE,
            BITMAP_NONE,
            BITMAP_PLUS,
            BITMAP_PLUS,
        ];
        let msg = build_bitmap(&codes, 1.0);
        let mut dest = vec![0.0f32; 5];
        decode_into(&msg, &mut dest).unwrap();
        assert_eq!(dest, vec![-1.0, 0.0, 0.0, 1.0, 1.0]);
    }
}
