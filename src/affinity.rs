//! Device-affinity capability used for worker index assignment.

/// Reports how many local compute devices exist and which one the calling
/// thread is bound to.
///
/// The accumulator uses this to give each worker a stable consumer index:
/// with one channel per device, a worker drains the channel living on its
/// own device and no cross-device copies happen on the hot path.
pub trait AffinityProvider: Send + Sync {
    /// Number of local compute devices.
    fn device_count(&self) -> usize;

    /// Device the calling thread is bound to, in `0..device_count()`.
    fn current_device(&self) -> usize;
}

/// Single-device (CPU or single-GPU) affinity: every thread sees device 0.
#[derive(Debug)]
pub struct UniformAffinity {
    devices: usize,
}

impl Default for UniformAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl UniformAffinity {
    /// One device, all threads on it.
    pub fn new() -> Self {
        Self { devices: 1 }
    }

    /// Pretend `devices` identical devices exist, all threads on device 0.
    /// Useful for exercising multi-device sizing paths on a host without
    /// accelerators.
    pub fn with_devices(devices: usize) -> Self {
        Self {
            devices: devices.max(1),
        }
    }
}

impl AffinityProvider for UniformAffinity {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn current_device(&self) -> usize {
        0
    }
}
