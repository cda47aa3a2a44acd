//! Residual post-processing: keeps the carried-over error bounded.

/// Invoked after every encode pass on the producer's residual buffer.
///
/// Without post-processing, elements that stay below threshold for many
/// consecutive steps accumulate without bound and then release as one large
/// stale update.
pub trait ResidualPostProcessor: Send + Sync {
    fn process(&self, iteration: u64, threshold: f32, residual: &mut [f32]);
}

/// Clips residual magnitude to `clip_multiple * threshold`, every
/// `frequency` iterations.
#[derive(Debug, Clone, Copy)]
pub struct ResidualClippingPostProcessor {
    clip_multiple: f32,
    frequency: u64,
}

impl ResidualClippingPostProcessor {
    pub fn new(clip_multiple: f32, frequency: u64) -> Self {
        Self {
            clip_multiple,
            frequency: frequency.max(1),
        }
    }
}

impl ResidualPostProcessor for ResidualClippingPostProcessor {
    fn process(&self, iteration: u64, threshold: f32, residual: &mut [f32]) {
        if iteration % self.frequency != 0 {
            return;
        }
        let bound = self.clip_multiple * threshold;
        let mut clipped = 0usize;
        for v in residual.iter_mut() {
            if *v > bound {
                *v = bound;
                clipped += 1;
            } else if *v < -bound {
                *v = -bound;
                clipped += 1;
            }
        }
        if clipped > 0 {
            tracing::debug!(iteration, clipped, bound, "clipped residual elements");
        }
    }
}
