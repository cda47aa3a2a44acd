pub type Result<T> = std::result::Result<T, GradSyncError>;

#[derive(Debug, thiserror::Error)]
pub enum GradSyncError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("update of {required} bytes does not fit arena slot of {slot} bytes")]
    Capacity { required: usize, slot: usize },

    #[error("unknown encoding header received: {header}")]
    UnknownEncoding { header: i32 },

    #[error(
        "buffer length mismatch: message encodes {expected} elements, destination holds {actual}"
    )]
    SizeMismatch { expected: usize, actual: usize },

    #[error("peer worker failed: {message}")]
    PropagatedPeer { message: String },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl GradSyncError {
    /// Create an `InvalidConfig` error from anything printable.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = GradSyncError::Capacity {
            required: 4096,
            slot: 1024,
        };
        assert_eq!(
            e.to_string(),
            "update of 4096 bytes does not fit arena slot of 1024 bytes"
        );
    }

    #[test]
    fn test_unknown_encoding_display() {
        let e = GradSyncError::UnknownEncoding { header: 77 };
        assert_eq!(e.to_string(), "unknown encoding header received: 77");
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<GradSyncError> = vec![
            GradSyncError::config("parties must be positive"),
            GradSyncError::Capacity {
                required: 10,
                slot: 5,
            },
            GradSyncError::UnknownEncoding { header: -1 },
            GradSyncError::SizeMismatch {
                expected: 100,
                actual: 50,
            },
            GradSyncError::PropagatedPeer {
                message: "boom".into(),
            },
            GradSyncError::LockPoisoned("barrier"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
