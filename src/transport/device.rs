//! Handle on the virtwl character device

use crate::sys::{self, VirtwlDmabufDesc};
use anyhow::{Context, Result};
use log::info;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared handle to an open virtwl device.
///
/// The shm driver, the data driver and the multiplexer all allocate from
/// the same device, so the descriptor is reference counted.
#[derive(Debug, Clone)]
pub struct VirtwlDevice {
    fd: Arc<OwnedFd>,
    path: PathBuf,
}

impl VirtwlDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .with_context(|| format!("Failed to open virtwl device {}", path.display()))?;
        info!("🔌 Opened virtwl device {}", path.display());
        Ok(Self {
            fd: Arc::new(file.into()),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn new_context(&self) -> io::Result<OwnedFd> {
        sys::virtwl_new_ctx(self.as_fd())
    }

    pub fn new_alloc(&self, size: u32) -> io::Result<OwnedFd> {
        sys::virtwl_new_alloc(self.as_fd(), size)
    }

    pub fn new_pipe_read(&self) -> io::Result<OwnedFd> {
        sys::virtwl_new_pipe_read(self.as_fd())
    }

    pub fn new_dmabuf(&self, width: u32, height: u32, format: u32) -> io::Result<(OwnedFd, VirtwlDmabufDesc)> {
        sys::virtwl_new_dmabuf(self.as_fd(), width, height, format)
    }

    pub fn supports_dmabuf(&self) -> bool {
        sys::virtwl_supports_dmabuf(self.as_fd())
    }
}

impl AsFd for VirtwlDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = VirtwlDevice::open(dir.path().join("wl0")).unwrap_err();
        assert!(err.to_string().contains("virtwl device"));
    }

    #[test]
    fn test_regular_file_is_not_a_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let dev = VirtwlDevice::open(file.path()).unwrap();
        assert!(dev.new_context().is_err());
        assert_eq!(dev.path(), file.path());
        // ENOTTY on a regular file
        assert!(!dev.supports_dmabuf());
    }
}
