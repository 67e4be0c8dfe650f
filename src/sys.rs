//! Kernel interfaces used by the buffer drivers and the transport
//!
//! Covers the virtwl character device (context, allocation, pipe and dmabuf
//! creation, message send/receive, dmabuf sync) and the generic
//! `DMA_BUF_IOCTL_SYNC` call used around CPU writes into GPU buffers.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Maximum number of descriptors a single virtwl transaction carries.
pub const VIRTWL_SEND_MAX_ALLOCS: usize = 28;

/// Size of the scratch buffer used for one virtwl transaction, header included.
pub const VIRTWL_TXN_BUFFER_SIZE: usize = 4096;

const VIRTWL_IOCTL_NEW_CTX: u32 = 0;
const VIRTWL_IOCTL_NEW_ALLOC: u32 = 1;
const VIRTWL_IOCTL_NEW_PIPE_READ: u32 = 2;
#[allow(dead_code)]
const VIRTWL_IOCTL_NEW_PIPE_WRITE: u32 = 3;
const VIRTWL_IOCTL_NEW_DMABUF: u32 = 4;

const VIRTWL_IOCTL_NEW: libc::c_ulong = 0xC030_7700;
const VIRTWL_IOCTL_SEND: libc::c_ulong = 0x8074_7701;
const VIRTWL_IOCTL_RECV: libc::c_ulong = 0x4074_7702;
const VIRTWL_IOCTL_DMABUF_SYNC: libc::c_ulong = 0x8004_7703;

const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Layout of a dmabuf allocated through virtwl.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtwlDmabufDesc {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub stride: [u32; 3],
    pub offset: [u32; 3],
}

/// `struct virtwl_ioctl_new`. The `size` member of the kernel union aliases
/// `dmabuf.width`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtwlIoctlNew {
    kind: u32,
    fd: i32,
    flags: u32,
    dmabuf: VirtwlDmabufDesc,
}

impl VirtwlIoctlNew {
    fn new(kind: u32) -> Self {
        Self {
            kind,
            fd: -1,
            flags: 0,
            dmabuf: VirtwlDmabufDesc::default(),
        }
    }

    fn with_size(kind: u32, size: u32) -> Self {
        let mut req = Self::new(kind);
        req.dmabuf.width = size;
        req
    }
}

/// Header of `struct virtwl_ioctl_txn`; the payload follows in memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtwlTxnHeader {
    pub fds: [i32; VIRTWL_SEND_MAX_ALLOCS],
    pub len: u32,
}

pub const VIRTWL_TXN_HEADER_SIZE: usize = std::mem::size_of::<VirtwlTxnHeader>();

fn ioctl_retry<T>(fd: RawFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    loop {
        // SAFETY: callers pass a pointer to a live, correctly sized ioctl argument.
        let rv = unsafe { libc::ioctl(fd, request as _, arg) };
        if rv == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn virtwl_new(device: BorrowedFd<'_>, req: &mut VirtwlIoctlNew) -> io::Result<OwnedFd> {
    ioctl_retry(device.as_raw_fd(), VIRTWL_IOCTL_NEW, req as *mut VirtwlIoctlNew)?;
    if req.fd < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "virtwl returned no descriptor",
        ));
    }
    // SAFETY: the kernel handed us ownership of a fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
}

/// Create a virtwl context: the host-transport channel for one connection.
pub fn virtwl_new_ctx(device: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    virtwl_new(device, &mut VirtwlIoctlNew::new(VIRTWL_IOCTL_NEW_CTX))
}

/// Allocate `size` bytes of host-shareable memory.
pub fn virtwl_new_alloc(device: BorrowedFd<'_>, size: u32) -> io::Result<OwnedFd> {
    virtwl_new(
        device,
        &mut VirtwlIoctlNew::with_size(VIRTWL_IOCTL_NEW_ALLOC, size),
    )
}

/// Create a pipe whose write end lives on the host.
pub fn virtwl_new_pipe_read(device: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    virtwl_new(device, &mut VirtwlIoctlNew::new(VIRTWL_IOCTL_NEW_PIPE_READ))
}

/// Allocate a host dmabuf and return it with its plane layout.
pub fn virtwl_new_dmabuf(
    device: BorrowedFd<'_>,
    width: u32,
    height: u32,
    format: u32,
) -> io::Result<(OwnedFd, VirtwlDmabufDesc)> {
    let mut req = VirtwlIoctlNew::new(VIRTWL_IOCTL_NEW_DMABUF);
    req.dmabuf.width = width;
    req.dmabuf.height = height;
    req.dmabuf.format = format;
    let fd = virtwl_new(device, &mut req)?;
    Ok((fd, req.dmabuf))
}

/// Probe whether the host implements dmabuf allocation.
///
/// Only `ENOTTY` means "unsupported"; other failures of the deliberately
/// invalid zero-sized request still indicate the ioctl exists.
pub fn virtwl_supports_dmabuf(device: BorrowedFd<'_>) -> bool {
    let mut req = VirtwlIoctlNew::new(VIRTWL_IOCTL_NEW_DMABUF);
    match ioctl_retry(device.as_raw_fd(), VIRTWL_IOCTL_NEW, &mut req as *mut _) {
        Ok(()) => {
            if req.fd >= 0 {
                // SAFETY: the probe produced a descriptor we own and discard.
                drop(unsafe { OwnedFd::from_raw_fd(req.fd) });
            }
            true
        }
        Err(err) => err.raw_os_error() != Some(libc::ENOTTY),
    }
}

/// Receive one transaction from a virtwl context into `buffer`.
///
/// Returns the payload length and the descriptors that came with it.
pub fn virtwl_recv(
    ctx: BorrowedFd<'_>,
    buffer: &mut [u8; VIRTWL_TXN_BUFFER_SIZE],
) -> io::Result<(usize, Vec<OwnedFd>)> {
    let header = buffer.as_mut_ptr() as *mut VirtwlTxnHeader;
    // SAFETY: the buffer is larger than the header; unaligned access is avoided
    // through read/write_unaligned.
    unsafe {
        let mut h = std::ptr::read_unaligned(header);
        h.len = (VIRTWL_TXN_BUFFER_SIZE - VIRTWL_TXN_HEADER_SIZE) as u32;
        h.fds = [-1; VIRTWL_SEND_MAX_ALLOCS];
        std::ptr::write_unaligned(header, h);
    }
    ioctl_retry(ctx.as_raw_fd(), VIRTWL_IOCTL_RECV, buffer.as_mut_ptr())?;
    // SAFETY: same as above, the kernel has filled the header in place.
    let h = unsafe { std::ptr::read_unaligned(header) };
    let fds = h
        .fds
        .iter()
        .take_while(|fd| **fd >= 0)
        // SAFETY: each non-negative slot is a descriptor now owned by us.
        .map(|fd| unsafe { OwnedFd::from_raw_fd(*fd) })
        .collect();
    Ok((h.len as usize, fds))
}

/// Send `data` and `fds` as one transaction on a virtwl context.
pub fn virtwl_send(ctx: BorrowedFd<'_>, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    let max = VIRTWL_TXN_BUFFER_SIZE - VIRTWL_TXN_HEADER_SIZE;
    if data.len() > max || fds.len() > VIRTWL_SEND_MAX_ALLOCS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "transaction exceeds virtwl limits",
        ));
    }
    let mut buffer = [0u8; VIRTWL_TXN_BUFFER_SIZE];
    let mut header = VirtwlTxnHeader {
        fds: [-1; VIRTWL_SEND_MAX_ALLOCS],
        len: data.len() as u32,
    };
    for (slot, fd) in header.fds.iter_mut().zip(fds) {
        *slot = fd.as_raw_fd();
    }
    // SAFETY: header fits at the start of the buffer.
    unsafe { std::ptr::write_unaligned(buffer.as_mut_ptr() as *mut VirtwlTxnHeader, header) };
    buffer[VIRTWL_TXN_HEADER_SIZE..VIRTWL_TXN_HEADER_SIZE + data.len()].copy_from_slice(data);
    ioctl_retry(ctx.as_raw_fd(), VIRTWL_IOCTL_SEND, buffer.as_mut_ptr())
}

/// `DMA_BUF_IOCTL_SYNC` on a dmabuf descriptor.
pub fn dmabuf_sync(fd: BorrowedFd<'_>, flags: u64) -> io::Result<()> {
    let mut arg = flags;
    ioctl_retry(fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC, &mut arg as *mut u64)
}

/// `VIRTWL_IOCTL_DMABUF_SYNC` on a virtwl dmabuf descriptor.
pub fn virtwl_dmabuf_sync(fd: BorrowedFd<'_>, flags: u64) -> io::Result<()> {
    let mut arg = flags as u32;
    ioctl_retry(fd.as_raw_fd(), VIRTWL_IOCTL_DMABUF_SYNC, &mut arg as *mut u32)
}

/// Clear `FD_CLOEXEC` so a descriptor survives into a spawned child.
pub fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor number.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts_match_uapi() {
        assert_eq!(std::mem::size_of::<VirtwlIoctlNew>(), 48);
        assert_eq!(VIRTWL_TXN_HEADER_SIZE, 116);
        // ioctl size fields encode the struct sizes above
        assert_eq!((VIRTWL_IOCTL_NEW >> 16) & 0x3fff, 48);
        assert_eq!((VIRTWL_IOCTL_SEND >> 16) & 0x3fff, 116);
        assert_eq!((VIRTWL_IOCTL_RECV >> 16) & 0x3fff, 116);
    }

    #[test]
    fn test_dmabuf_sync_flags() {
        assert_eq!(DMA_BUF_SYNC_START | DMA_BUF_SYNC_WRITE, 2);
        assert_eq!(DMA_BUF_SYNC_END | DMA_BUF_SYNC_WRITE, 6);
        assert_eq!(DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE, 3);
    }

    #[test]
    fn test_virtwl_send_rejects_oversized_payload() {
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::fd::AsFd::as_fd(&file);
        let data = vec![0u8; VIRTWL_TXN_BUFFER_SIZE];
        let err = virtwl_send(fd, &data, &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_ioctl_on_regular_file_fails() {
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::fd::AsFd::as_fd(&file);
        assert!(dmabuf_sync(fd, DMA_BUF_SYNC_START | DMA_BUF_SYNC_WRITE).is_err());
        assert!(!virtwl_supports_dmabuf(fd));
    }
}
