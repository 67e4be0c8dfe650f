//! Pixel format tables for shm content

use drm::buffer::DrmFourcc;

/// Shared-memory formats the pipeline can copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShmFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
    Nv12,
}

impl ShmFormat {
    /// Decode a `wl_shm.format` value.
    pub fn from_wl(code: u32) -> Option<Self> {
        match code {
            0 => Some(ShmFormat::Argb8888),
            1 => Some(ShmFormat::Xrgb8888),
            0x3432_4241 => Some(ShmFormat::Abgr8888),
            0x3432_4258 => Some(ShmFormat::Xbgr8888),
            0x3631_4752 => Some(ShmFormat::Rgb565),
            0x3231_564e => Some(ShmFormat::Nv12),
            _ => None,
        }
    }

    pub fn to_wl(self) -> u32 {
        match self {
            ShmFormat::Argb8888 => 0,
            ShmFormat::Xrgb8888 => 1,
            other => other.drm_fourcc() as u32,
        }
    }

    /// Matching DRM fourcc, used for dmabuf import.
    pub fn drm_fourcc(self) -> DrmFourcc {
        match self {
            ShmFormat::Argb8888 => DrmFourcc::Argb8888,
            ShmFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
            ShmFormat::Abgr8888 => DrmFourcc::Abgr8888,
            ShmFormat::Xbgr8888 => DrmFourcc::Xbgr8888,
            ShmFormat::Rgb565 => DrmFourcc::Rgb565,
            ShmFormat::Nv12 => DrmFourcc::Nv12,
        }
    }

    /// Map a DRM fourcc advertised by the host back to a shm format.
    pub fn from_drm(code: u32) -> Option<Self> {
        [
            ShmFormat::Argb8888,
            ShmFormat::Xrgb8888,
            ShmFormat::Abgr8888,
            ShmFormat::Xbgr8888,
            ShmFormat::Rgb565,
            ShmFormat::Nv12,
        ]
        .into_iter()
        .find(|f| f.drm_fourcc() as u32 == code)
    }

    /// Bytes per pixel of the first plane (NV12 luma is one byte).
    pub fn bpp(self) -> usize {
        match self {
            ShmFormat::Nv12 => 1,
            ShmFormat::Rgb565 => 2,
            _ => 4,
        }
    }

    pub fn num_planes(self) -> usize {
        match self {
            ShmFormat::Nv12 => 2,
            _ => 1,
        }
    }

    pub fn y_subsampling(self, plane: usize) -> usize {
        match (self, plane) {
            (ShmFormat::Nv12, 1) => 2,
            _ => 1,
        }
    }

    /// Offset of `plane` relative to the buffer's first byte.
    pub fn plane_offset(self, plane: usize, height: usize, stride: usize) -> usize {
        match (self, plane) {
            (ShmFormat::Nv12, 1) => height * stride,
            _ => 0,
        }
    }

    /// Bytes a buffer of this format occupies.
    pub fn buffer_size(self, height: usize, stride: usize) -> usize {
        (0..self.num_planes())
            .map(|plane| {
                height / self.y_subsampling(plane) * stride + self.plane_offset(plane, height, stride)
            })
            .max()
            .unwrap_or(0)
    }

    /// Whether the guest may see this format when the host advertises it
    /// through `wl_shm` (NV12 is only forwarded from linux-dmabuf).
    pub fn forwarded_from_shm(self) -> bool {
        self != ShmFormat::Nv12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wl_codes_round_trip() {
        for code in [0u32, 1, 0x3432_4241, 0x3432_4258, 0x3631_4752, 0x3231_564e] {
            assert_eq!(ShmFormat::from_wl(code).unwrap().to_wl(), code);
        }
        assert!(ShmFormat::from_wl(42).is_none());
    }

    #[test]
    fn test_drm_mapping_differs_for_argb() {
        assert_eq!(ShmFormat::Argb8888.drm_fourcc() as u32, 0x3432_5241);
        assert_eq!(ShmFormat::from_drm(0x3432_5258), Some(ShmFormat::Xrgb8888));
    }

    #[test]
    fn test_nv12_layout() {
        let f = ShmFormat::Nv12;
        assert_eq!(f.bpp(), 1);
        assert_eq!(f.num_planes(), 2);
        assert_eq!(f.y_subsampling(0), 1);
        assert_eq!(f.y_subsampling(1), 2);
        assert_eq!(f.plane_offset(1, 100, 128), 12800);
        // luma 100 rows + chroma 50 rows
        assert_eq!(f.buffer_size(100, 128), 150 * 128);
    }

    #[test]
    fn test_packed_sizes() {
        assert_eq!(ShmFormat::Rgb565.bpp(), 2);
        assert_eq!(ShmFormat::Argb8888.buffer_size(10, 40), 400);
    }
}
