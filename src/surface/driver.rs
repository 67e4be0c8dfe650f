//! Output-buffer backing strategies
//!
//! A driver turns a guest shm buffer description into host-importable memory
//! plus a CPU mapping of it. The server glue turns the returned
//! [`HostImport`] into a host `wl_buffer`.

use super::format::ShmFormat;
use crate::error::{BridgeError, BridgeResult};
use crate::mmap::{MapLayout, MappedBuffer, PlaneLayout, WriteSync};
use crate::transport::VirtwlDevice;
use anyhow::{Context, Result};
use log::{debug, info};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Which shm strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShmDriverKind {
    Noop,
    Dmabuf,
    Virtwl,
    VirtwlDmabuf,
}

impl ShmDriverKind {
    pub fn name(self) -> &'static str {
        match self {
            ShmDriverKind::Noop => "noop",
            ShmDriverKind::Dmabuf => "dmabuf",
            ShmDriverKind::Virtwl => "virtwl",
            ShmDriverKind::VirtwlDmabuf => "virtwl-dmabuf",
        }
    }

    /// Whether the host side of `wl_shm` is backed by linux-dmabuf.
    pub fn uses_linux_dmabuf(self) -> bool {
        matches!(self, ShmDriverKind::Dmabuf | ShmDriverKind::VirtwlDmabuf)
    }

    /// Pass-through drivers forward guest pools directly.
    pub fn is_pass_through(self) -> bool {
        self == ShmDriverKind::Noop
    }
}

impl fmt::Display for ShmDriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShmDriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "noop" => Ok(ShmDriverKind::Noop),
            "dmabuf" => Ok(ShmDriverKind::Dmabuf),
            "virtwl" => Ok(ShmDriverKind::Virtwl),
            "virtwl-dmabuf" => Ok(ShmDriverKind::VirtwlDmabuf),
            other => anyhow::bail!("unknown shm driver '{}'", other),
        }
    }
}

/// Description of a guest shm buffer that needs an output buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferSpec<'a> {
    pub width: u32,
    pub height: u32,
    pub format: ShmFormat,
    /// Layout of the guest's own mapping.
    pub guest: &'a MapLayout,
}

/// How the host should import a freshly allocated buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostImport {
    /// `wl_shm.create_pool(fd, size)` then `create_buffer(0, w, h, stride, format)`.
    Shm {
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: ShmFormat,
    },
    /// `zwp_linux_buffer_params_v1.add` per plane then `create_immed`.
    Dmabuf {
        width: i32,
        height: i32,
        fourcc: u32,
        /// `(offset, stride)` per plane.
        planes: Vec<(u32, u32)>,
    },
}

/// A backing allocation: the CPU mapping (which owns the descriptor) and how
/// the host imports it.
#[derive(Debug)]
pub struct Allocation {
    pub map: Arc<MappedBuffer>,
    pub import: HostImport,
}

pub enum BackingDriver {
    Noop,
    #[cfg(feature = "dmabuf")]
    Dmabuf(gbm::Device<std::fs::File>),
    Virtwl(VirtwlDevice),
    VirtwlDmabuf(VirtwlDevice),
}

impl fmt::Debug for BackingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackingDriver({})", self.kind())
    }
}

impl BackingDriver {
    /// Open the GBM device used by the `dmabuf` driver.
    #[cfg(feature = "dmabuf")]
    pub fn open_gbm<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open DRM device {}", path.display()))?;
        let device = gbm::Device::new(file)
            .with_context(|| format!("Failed to create GBM device on {}", path.display()))?;
        info!("🎨 Using GBM device {}", path.display());
        Ok(BackingDriver::Dmabuf(device))
    }

    #[cfg(not(feature = "dmabuf"))]
    pub fn open_gbm<P: AsRef<Path>>(path: P) -> Result<Self> {
        anyhow::bail!(
            "dmabuf driver requested for {} but crossway was built without the `dmabuf` feature",
            path.as_ref().display()
        )
    }

    pub fn kind(&self) -> ShmDriverKind {
        match self {
            BackingDriver::Noop => ShmDriverKind::Noop,
            #[cfg(feature = "dmabuf")]
            BackingDriver::Dmabuf(_) => ShmDriverKind::Dmabuf,
            BackingDriver::Virtwl(_) => ShmDriverKind::Virtwl,
            BackingDriver::VirtwlDmabuf(_) => ShmDriverKind::VirtwlDmabuf,
        }
    }

    /// Allocate an output buffer for `spec`.
    ///
    /// Any failure is [`BridgeError::AllocationFatal`]; there is no fallback
    /// once a driver has been chosen.
    pub fn allocate(&self, spec: BufferSpec<'_>) -> BridgeResult<Allocation> {
        let driver = self.kind().name();
        let allocation = match self {
            BackingDriver::Noop => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "pass-through driver has no output buffers",
            )),
            #[cfg(feature = "dmabuf")]
            BackingDriver::Dmabuf(gbm) => allocate_gbm(gbm, spec),
            BackingDriver::Virtwl(dev) => allocate_virtwl(dev, spec),
            BackingDriver::VirtwlDmabuf(dev) => allocate_virtwl_dmabuf(dev, spec),
        }
        .map_err(|e| BridgeError::allocation(driver, e))?;

        debug!(
            "🧱 {} allocated {}x{} {:?} output buffer",
            driver, spec.width, spec.height, spec.format
        );
        Ok(allocation)
    }
}

fn map_err(e: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{:#}", e))
}

#[cfg(feature = "dmabuf")]
fn allocate_gbm(gbm: &gbm::Device<std::fs::File>, spec: BufferSpec<'_>) -> io::Result<Allocation> {
    let bo = gbm.create_buffer_object::<()>(
        spec.width,
        spec.height,
        spec.format.drm_fourcc(),
        gbm::BufferObjectFlags::SCANOUT | gbm::BufferObjectFlags::LINEAR,
    )?;
    let stride = bo
        .stride()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let fd = bo
        .fd()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let size = spec.height as usize * stride as usize;
    let map = MappedBuffer::map(
        fd,
        MapLayout::single_plane(size, spec.format.bpp(), 0, stride as usize),
        WriteSync::DmaBuf,
    )
    .map_err(map_err)?;
    Ok(Allocation {
        map,
        import: HostImport::Dmabuf {
            width: spec.width as i32,
            height: spec.height as i32,
            fourcc: spec.format.drm_fourcc() as u32,
            planes: vec![(0, stride)],
        },
    })
}

fn allocate_virtwl(dev: &VirtwlDevice, spec: BufferSpec<'_>) -> io::Result<Allocation> {
    let size = spec.guest.size;
    let fd = dev.new_alloc(size as u32)?;

    // Same plane layout as the guest, rebased to offset zero.
    let base = spec.guest.planes.first().map(|p| p.offset).unwrap_or(0);
    let planes: Vec<PlaneLayout> = spec
        .guest
        .planes
        .iter()
        .map(|p| PlaneLayout::new(p.offset - base, p.stride, p.y_subsampling))
        .collect();
    let stride = planes.first().map(|p| p.stride).unwrap_or(0);

    let map = MappedBuffer::map(
        fd,
        MapLayout {
            size,
            bpp: spec.guest.bpp,
            planes,
        },
        WriteSync::None,
    )
    .map_err(map_err)?;
    Ok(Allocation {
        map,
        import: HostImport::Shm {
            size: size as i32,
            width: spec.width as i32,
            height: spec.height as i32,
            stride: stride as i32,
            format: spec.format,
        },
    })
}

fn allocate_virtwl_dmabuf(dev: &VirtwlDevice, spec: BufferSpec<'_>) -> io::Result<Allocation> {
    let fourcc = spec.format.drm_fourcc() as u32;
    let (fd, desc) = dev.new_dmabuf(spec.width, spec.height, fourcc)?;
    let layout = virtwl_dmabuf_layout(spec, desc.offset, desc.stride);
    let planes = layout
        .planes
        .iter()
        .map(|p| (p.offset as u32, p.stride as u32))
        .collect();
    let map = MappedBuffer::map(fd, layout, WriteSync::Virtwl).map_err(map_err)?;
    Ok(Allocation {
        map,
        import: HostImport::Dmabuf {
            width: spec.width as i32,
            height: spec.height as i32,
            fourcc,
            planes,
        },
    })
}

/// Mapping layout of a virtwl dmabuf: the first plane's rows, extended to
/// cover the second plane when there is one.
fn virtwl_dmabuf_layout(spec: BufferSpec<'_>, offset: [u32; 3], stride: [u32; 3]) -> MapLayout {
    let height = spec.height as usize;
    let num_planes = spec.format.num_planes();
    let subsampling = |plane: usize| {
        spec.guest
            .planes
            .get(plane)
            .map(|p| p.y_subsampling)
            .unwrap_or_else(|| spec.format.y_subsampling(plane))
    };

    let mut size = stride[0] as usize * height;
    if num_planes > 1 {
        size = size.max(offset[1] as usize + stride[1] as usize * height / subsampling(1));
    }
    MapLayout {
        size,
        bpp: spec.format.bpp(),
        planes: (0..num_planes)
            .map(|i| PlaneLayout::new(offset[i] as usize, stride[i] as usize, subsampling(i)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_names_round_trip() {
        for kind in [
            ShmDriverKind::Noop,
            ShmDriverKind::Dmabuf,
            ShmDriverKind::Virtwl,
            ShmDriverKind::VirtwlDmabuf,
        ] {
            assert_eq!(kind.name().parse::<ShmDriverKind>().unwrap(), kind);
        }
        assert!("vulkan".parse::<ShmDriverKind>().is_err());
    }

    #[test]
    fn test_linux_dmabuf_users() {
        assert!(ShmDriverKind::VirtwlDmabuf.uses_linux_dmabuf());
        assert!(!ShmDriverKind::Virtwl.uses_linux_dmabuf());
        assert!(ShmDriverKind::Noop.is_pass_through());
    }

    #[test]
    fn test_noop_allocation_is_fatal() {
        let guest = MapLayout::single_plane(64, 4, 0, 16);
        let err = BackingDriver::Noop
            .allocate(BufferSpec {
                width: 4,
                height: 4,
                format: ShmFormat::Argb8888,
                guest: &guest,
            })
            .unwrap_err();
        assert!(err.is_fatal_to_process());
    }

    #[test]
    fn test_virtwl_dmabuf_layout_two_planes() {
        let guest = MapLayout {
            size: 150 * 128,
            bpp: 1,
            planes: vec![PlaneLayout::new(0, 128, 1), PlaneLayout::new(12800, 128, 2)],
        };
        let spec = BufferSpec {
            width: 100,
            height: 100,
            format: ShmFormat::Nv12,
            guest: &guest,
        };
        let layout = virtwl_dmabuf_layout(spec, [0, 16384, 0], [128, 128, 0]);
        assert_eq!(layout.size, 16384 + 128 * 50);
        assert_eq!(layout.planes[1], PlaneLayout::new(16384, 128, 2));
    }

    #[test]
    fn test_virtwl_dmabuf_layout_single_plane() {
        let guest = MapLayout::single_plane(40 * 10, 4, 0, 40);
        let spec = BufferSpec {
            width: 10,
            height: 10,
            format: ShmFormat::Xrgb8888,
            guest: &guest,
        };
        let layout = virtwl_dmabuf_layout(spec, [0; 3], [64, 0, 0]);
        assert_eq!(layout.size, 640);
        assert_eq!(layout.num_planes(), 1);
    }
}
