use gogh_core::CpuDevice;

// Device selection
//
// The engine is generic over Backend, but only the CPU backend is built
// in, so "selection" collapses to handing out the one device plus the
// image-size policy that goes with it: direct pixel optimization through
// a VGG prefix is memory- and compute-hungry, and on a CPU anything past
// 128×128 turns minutes into hours. Callers that request more get the cap.

/// Largest image edge worth optimizing on the CPU backend.
pub const CPU_MAX_IMAGE_SIZE: usize = 128;

/// The device stylization runs on.
pub fn default_device() -> CpuDevice {
    CpuDevice
}

/// The image size actually used for a requested output size on the
/// default device.
pub fn max_image_size(requested: usize) -> usize {
    requested.min(CPU_MAX_IMAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_cap() {
        assert_eq!(max_image_size(512), CPU_MAX_IMAGE_SIZE);
        assert_eq!(max_image_size(64), 64);
        assert_eq!(max_image_size(128), 128);
    }
}
