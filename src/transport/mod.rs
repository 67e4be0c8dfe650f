//! Transport multiplexer
//!
//! When the host compositor is only reachable through a virtwl context, the
//! bridge talks Wayland over one end of a local socket pair and this module
//! pumps the other end to and from the context. Each transaction keeps its
//! descriptors: bytes and descriptors read from one side leave the other side
//! in the same message.

pub mod device;

pub use device::VirtwlDevice;

use crate::sys::{self, VIRTWL_SEND_MAX_ALLOCS, VIRTWL_TXN_BUFFER_SIZE};
use log::{debug, trace, warn};
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

/// Largest payload of one relayed message.
pub const MAX_MESSAGE_SIZE: usize = VIRTWL_TXN_BUFFER_SIZE;

/// A message channel that carries descriptors alongside bytes.
#[cfg_attr(test, mockall::automock)]
pub trait VirtualChannel {
    /// Send one message. Partial sends are not allowed.
    fn send(&self, data: &[u8], fds: Vec<OwnedFd>) -> io::Result<()>;

    /// Receive one message into `buf`. A zero-length message without
    /// descriptors means the peer hung up.
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)>;
}

/// A virtwl context descriptor.
#[derive(Debug)]
pub struct VirtwlContext {
    fd: OwnedFd,
}

impl VirtwlContext {
    pub fn new(device: &VirtwlDevice) -> io::Result<Self> {
        Ok(Self {
            fd: device.new_context()?,
        })
    }
}

impl AsFd for VirtwlContext {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl VirtualChannel for VirtwlContext {
    fn send(&self, data: &[u8], fds: Vec<OwnedFd>) -> io::Result<()> {
        let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
        sys::virtwl_send(self.fd.as_fd(), data, &borrowed)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let mut txn = [0u8; VIRTWL_TXN_BUFFER_SIZE];
        let (len, fds) = sys::virtwl_recv(self.fd.as_fd(), &mut txn)?;
        let payload = txn_payload(&txn, len);
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, fds))
    }
}

/// Payload of a received transaction. The length reported in the header is
/// clamped to what the transaction buffer can hold.
fn txn_payload(txn: &[u8; VIRTWL_TXN_BUFFER_SIZE], len: usize) -> &[u8] {
    let len = len.min(VIRTWL_TXN_BUFFER_SIZE - sys::VIRTWL_TXN_HEADER_SIZE);
    &txn[sys::VIRTWL_TXN_HEADER_SIZE..sys::VIRTWL_TXN_HEADER_SIZE + len]
}

/// Whether the pump should keep its descriptors registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    Open,
    /// The socket is full. Stop reading the channel and call
    /// [`Multiplexer::socket_writable`] once the socket can take more.
    Blocked,
    /// One side hung up or failed; the connection is over.
    Closed,
}

/// A channel message not yet fully written to the socket. The descriptors go
/// out with the first byte that is accepted.
struct Pending {
    data: Vec<u8>,
    sent: usize,
    fds: Vec<OwnedFd>,
}

/// Relays messages between a [`VirtualChannel`] and a local socket.
pub struct Multiplexer<C> {
    channel: C,
    socket: UnixStream,
    outgoing: VecDeque<Pending>,
    relayed: u64,
}

impl<C: VirtualChannel> Multiplexer<C> {
    pub fn new(channel: C, socket: UnixStream) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            channel,
            socket,
            outgoing: VecDeque::new(),
            relayed: 0,
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    /// Messages relayed so far, both directions.
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Bytes of channel messages still waiting for the socket.
    pub fn queued_bytes(&self) -> usize {
        self.outgoing.iter().map(|p| p.data.len() - p.sent).sum()
    }

    /// The channel has a message: forward it to the socket.
    pub fn channel_readable(&mut self) -> PumpStatus {
        if !self.outgoing.is_empty() {
            return PumpStatus::Blocked;
        }
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let (len, fds) = match self.channel.recv(&mut buf) {
            Ok(message) => message,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return PumpStatus::Open,
            Err(err) => {
                warn!("⚠️ Virtual channel read failed: {}", err);
                return PumpStatus::Closed;
            }
        };
        if len == 0 && fds.is_empty() {
            debug!("🔌 Virtual channel closed");
            return PumpStatus::Closed;
        }
        trace!("➡️ channel -> socket: {} bytes, {} fds", len, fds.len());
        self.relayed += 1;
        self.outgoing.push_back(Pending {
            data: buf[..len].to_vec(),
            sent: 0,
            fds,
        });
        self.flush_outgoing()
    }

    /// The socket accepts data again: continue the queued messages.
    pub fn socket_writable(&mut self) -> PumpStatus {
        self.flush_outgoing()
    }

    fn flush_outgoing(&mut self) -> PumpStatus {
        while let Some(pending) = self.outgoing.front_mut() {
            let result = send_some(&self.socket, &pending.data[pending.sent..], &pending.fds);
            match result {
                Ok(n) => {
                    pending.sent += n;
                    pending.fds.clear();
                    if pending.sent == pending.data.len() {
                        self.outgoing.pop_front();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    trace!("⏸️ Socket full, {} bytes queued", self.queued_bytes());
                    return PumpStatus::Blocked;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("⚠️ Socket write failed: {}", err);
                    return PumpStatus::Closed;
                }
            }
        }
        PumpStatus::Open
    }

    /// The socket has a message: forward it to the channel.
    pub fn socket_readable(&mut self) -> PumpStatus {
        let mut buf = [0u8; MAX_MESSAGE_SIZE - sys::VIRTWL_TXN_HEADER_SIZE];
        let (len, fds) = match recv_with_fds(&self.socket, &mut buf) {
            Ok(message) => message,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return PumpStatus::Open,
            Err(err) => {
                warn!("⚠️ Socket read failed: {}", err);
                return PumpStatus::Closed;
            }
        };
        if len == 0 && fds.is_empty() {
            debug!("🔌 Guest side of the channel closed");
            return PumpStatus::Closed;
        }
        trace!("⬅️ socket -> channel: {} bytes, {} fds", len, fds.len());
        match self.channel.send(&buf[..len], fds) {
            Ok(()) => {
                self.relayed += 1;
                PumpStatus::Open
            }
            Err(err) => {
                warn!("⚠️ Virtual channel write failed: {}", err);
                PumpStatus::Closed
            }
        }
    }
}

/// One `sendmsg` with the descriptors attached as `SCM_RIGHTS`. Returns how
/// many bytes the socket took; the descriptors travel with the first of them.
pub fn send_some(socket: &UnixStream, data: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(VIRTWL_SEND_MAX_ALLOCS))];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !borrowed.is_empty() && !control.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many descriptors in one message",
        ));
    }
    Ok(sendmsg(socket, &[IoSlice::new(data)], &mut control, SendFlags::NOSIGNAL)?)
}

/// `recvmsg` collecting any `SCM_RIGHTS` descriptors.
pub fn recv_with_fds(socket: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut space = [0u8; rustix::cmsg_space!(ScmRights(VIRTWL_SEND_MAX_ALLOCS))];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let msg = recvmsg(
        socket,
        &mut [IoSliceMut::new(buf)],
        &mut control,
        RecvFlags::CMSG_CLOEXEC,
    )?;
    let mut fds = Vec::new();
    for message in control.drain() {
        if let RecvAncillaryMessage::ScmRights(received) = message {
            fds.extend(received);
        }
    }
    Ok((msg.bytes, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::net::UnixStream;

    fn tagged_file(tag: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(tag).unwrap();
        file.into()
    }

    fn read_tag(fd: OwnedFd) -> Vec<u8> {
        let mut file = std::fs::File::from(fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_channel_message_reaches_socket_with_fds() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut channel = MockVirtualChannel::new();
        channel.expect_recv().times(1).returning(|buf| {
            buf[..5].copy_from_slice(b"hello");
            Ok((5, vec![tagged_file(b"fd-one")]))
        });

        let mut mux = Multiplexer::new(channel, ours).unwrap();
        assert_eq!(mux.channel_readable(), PumpStatus::Open);
        assert_eq!(mux.relayed(), 1);

        let mut buf = [0u8; 64];
        let (len, fds) = recv_with_fds(&theirs, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(fds.len(), 1);
        assert_eq!(read_tag(fds.into_iter().next().unwrap()), b"fd-one");
    }

    #[test]
    fn test_socket_message_reaches_channel_with_fds() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut channel = MockVirtualChannel::new();
        channel
            .expect_send()
            .withf(|data, fds| data == b"request" && fds.len() == 2)
            .times(1)
            .returning(|_, _| Ok(()));

        send_some(&theirs, b"request", &[tagged_file(b"a"), tagged_file(b"b")]).unwrap();
        let mut mux = Multiplexer::new(channel, ours).unwrap();
        assert_eq!(mux.socket_readable(), PumpStatus::Open);
    }

    #[test]
    fn test_channel_failure_closes_the_pump() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let mut channel = MockVirtualChannel::new();
        channel
            .expect_recv()
            .returning(|_| Err(io::Error::from_raw_os_error(libc::EIO)));
        let mut mux = Multiplexer::new(channel, ours).unwrap();
        assert_eq!(mux.channel_readable(), PumpStatus::Closed);
    }

    #[test]
    fn test_socket_hangup_closes_the_pump() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let channel = MockVirtualChannel::new();
        let mut mux = Multiplexer::new(channel, ours).unwrap();
        assert_eq!(mux.socket_readable(), PumpStatus::Closed);
    }

    /// Fill a non-blocking socket until it refuses more.
    fn fill(socket: &UnixStream) -> usize {
        socket.set_nonblocking(true).unwrap();
        let chunk = [0x11u8; 4096];
        let mut total = 0;
        loop {
            match send_some(socket, &chunk, &[]) {
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return total,
                Err(err) => panic!("unexpected send error: {}", err),
            }
        }
    }

    #[test]
    fn test_full_socket_queues_and_resumes() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let mut channel = MockVirtualChannel::new();
        channel.expect_recv().times(1).returning(|buf| {
            buf[..7].copy_from_slice(b"message");
            Ok((7, vec![tagged_file(b"fd")]))
        });
        let mut mux = Multiplexer::new(channel, ours).unwrap();
        let filler = fill(mux.socket());

        assert_eq!(mux.channel_readable(), PumpStatus::Blocked);
        assert_eq!(mux.queued_bytes(), 7);
        // channel reads wait while the queue is not empty
        assert_eq!(mux.channel_readable(), PumpStatus::Blocked);
        assert_eq!(mux.socket_writable(), PumpStatus::Blocked);

        let mut drained = vec![0u8; filler];
        theirs.read_exact(&mut drained).unwrap();
        assert_eq!(mux.socket_writable(), PumpStatus::Open);
        assert_eq!(mux.queued_bytes(), 0);

        let mut buf = [0u8; 64];
        let (len, fds) = recv_with_fds(&theirs, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"message");
        assert_eq!(read_tag(fds.into_iter().next().unwrap()), b"fd");
    }

    #[test]
    fn test_oversized_length_is_clamped() {
        let txn = [7u8; VIRTWL_TXN_BUFFER_SIZE];
        let payload = txn_payload(&txn, usize::MAX);
        assert_eq!(payload.len(), VIRTWL_TXN_BUFFER_SIZE - sys::VIRTWL_TXN_HEADER_SIZE);
        assert_eq!(txn_payload(&txn, 3).len(), 3);
    }

    #[test]
    fn test_empty_socket_is_not_a_hangup() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let channel = MockVirtualChannel::new();
        let mut mux = Multiplexer::new(channel, ours).unwrap();
        assert_eq!(mux.socket_readable(), PumpStatus::Open);
        assert_eq!(mux.relayed(), 0);
    }
}
