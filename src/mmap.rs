//! Shared-ownership mappings of shm and dmabuf descriptors
//!
//! A [`MappedBuffer`] owns the descriptor and the mapping. Handles are shared
//! as `Arc<MappedBuffer>`; the region is unmapped and the descriptor closed
//! when the last handle drops, so no manual reference counting exists.

use crate::sys;
use anyhow::{Context, Result};
use log::warn;
use memmap2::{MmapOptions, MmapRaw};
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Byte layout of one image plane inside a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub stride: usize,
    /// Vertical subsampling: a plane holds `height / y_subsampling` rows.
    pub y_subsampling: usize,
}

impl PlaneLayout {
    pub fn new(offset: usize, stride: usize, y_subsampling: usize) -> Self {
        Self {
            offset,
            stride,
            y_subsampling: y_subsampling.max(1),
        }
    }
}

/// Cache-coherency calls issued around CPU writes into the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteSync {
    #[default]
    None,
    /// Generic `DMA_BUF_IOCTL_SYNC`.
    DmaBuf,
    /// virtwl dmabuf sync ioctl.
    Virtwl,
}

impl WriteSync {
    fn issue(self, fd: BorrowedFd<'_>, flags: u64) {
        let result = match self {
            WriteSync::None => return,
            WriteSync::DmaBuf => sys::dmabuf_sync(fd, flags),
            WriteSync::Virtwl => sys::virtwl_dmabuf_sync(fd, flags),
        };
        if let Err(e) = result {
            warn!("⚠️ {:?} write sync (flags {:#x}) failed: {}", self, flags, e);
        }
    }

    pub fn begin_write(self, fd: BorrowedFd<'_>) {
        self.issue(fd, sys::DMA_BUF_SYNC_START | sys::DMA_BUF_SYNC_WRITE);
    }

    pub fn end_write(self, fd: BorrowedFd<'_>) {
        self.issue(fd, sys::DMA_BUF_SYNC_END | sys::DMA_BUF_SYNC_WRITE);
    }
}

/// Parameters of a mapping; see [`MappedBuffer::map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLayout {
    /// Bytes needed past the first plane's offset.
    pub size: usize,
    pub bpp: usize,
    pub planes: Vec<PlaneLayout>,
}

impl MapLayout {
    pub fn single_plane(size: usize, bpp: usize, offset: usize, stride: usize) -> Self {
        Self {
            size,
            bpp,
            planes: vec![PlaneLayout::new(offset, stride, 1)],
        }
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }
}

pub struct MappedBuffer {
    fd: OwnedFd,
    map: MmapRaw,
    layout: MapLayout,
    sync: WriteSync,
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("len", &self.map.len())
            .field("layout", &self.layout)
            .field("sync", &self.sync)
            .finish()
    }
}

impl MappedBuffer {
    /// Map `layout.size + planes[0].offset` bytes of `fd` read/write and shared.
    pub fn map(fd: OwnedFd, layout: MapLayout, sync: WriteSync) -> Result<Arc<Self>> {
        let first_offset = layout.planes.first().map(|p| p.offset).unwrap_or(0);
        let len = layout.size + first_offset;
        if len == 0 {
            anyhow::bail!("refusing to map an empty buffer");
        }
        let file = File::from(fd);
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .with_context(|| format!("Failed to map {} bytes", len))?;
        Ok(Arc::new(Self {
            fd: file.into(),
            map,
            layout,
            sync,
        }))
    }

    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    pub fn bpp(&self) -> usize {
        self.layout.bpp
    }

    pub fn plane(&self, index: usize) -> Option<PlaneLayout> {
        self.layout.planes.get(index).copied()
    }

    pub fn num_planes(&self) -> usize {
        self.layout.num_planes()
    }

    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn sync(&self) -> WriteSync {
        self.sync
    }

    /// Read-only view of the whole mapping.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping lives as long as `self`. The memory is shared with
        // another process, which may race with us; we only copy bytes out.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr(), self.map.len()) }
    }

    /// Run `f` over a writable view, bracketed by the begin/end write hooks.
    pub fn write_with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.sync.begin_write(self.fd.as_fd());
        // SAFETY: the bridge is single threaded and never holds another view of
        // this mapping while `f` runs.
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.map.len()) };
        let result = f(bytes);
        self.sync.end_write(self.fd.as_fd());
        result
    }
}

impl AsFd for MappedBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_of(bytes: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.into()
    }

    #[test]
    fn test_map_reads_file_contents() {
        let fd = file_of(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let map = MappedBuffer::map(fd, MapLayout::single_plane(8, 4, 0, 8), WriteSync::None)
            .unwrap();
        assert_eq!(map.bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(map.bpp(), 4);
        assert_eq!(map.num_planes(), 1);
    }

    #[test]
    fn test_offset_extends_mapping() {
        let fd = file_of(&[0u8; 32]);
        let map = MappedBuffer::map(fd, MapLayout::single_plane(16, 4, 16, 8), WriteSync::None)
            .unwrap();
        assert_eq!(map.len(), 32);
        assert_eq!(map.plane(0).unwrap().offset, 16);
        assert!(map.plane(1).is_none());
    }

    #[test]
    fn test_writes_are_shared_between_handles() {
        let fd = file_of(&[0u8; 4]);
        let map = MappedBuffer::map(fd, MapLayout::single_plane(4, 1, 0, 4), WriteSync::None)
            .unwrap();
        let other = Arc::clone(&map);
        map.write_with(|bytes| bytes.copy_from_slice(&[9, 8, 7, 6]));
        assert_eq!(other.bytes(), &[9, 8, 7, 6]);
        drop(map);
        assert_eq!(Arc::strong_count(&other), 1);
    }

    #[test]
    fn test_empty_mapping_is_rejected() {
        let fd = file_of(&[]);
        assert!(MappedBuffer::map(fd, MapLayout::single_plane(0, 4, 0, 0), WriteSync::None).is_err());
    }

    #[test]
    fn test_plane_subsampling_never_zero() {
        assert_eq!(PlaneLayout::new(0, 4, 0).y_subsampling, 1);
    }
}
