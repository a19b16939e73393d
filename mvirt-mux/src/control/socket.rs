//! Control channel transport.
//!
//! The service talks to its peer through `SbListen`/`SbConn` so the state
//! machine can run over a real abstract `SOCK_SEQPACKET` socket or a
//! scripted connection in tests.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr, accept4, bind, connect,
    listen, recv, send, socket,
};
use tracing::debug;

const LISTEN_BACKLOG: i32 = 128;

/// Result of one non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// Nothing pending.
    Empty,
    /// One message of this many bytes.
    Data(usize),
    /// Peer closed or reset the connection.
    Closed,
}

/// Result of one non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent(usize),
    WouldBlock,
    /// Peer reset the connection.
    Reset,
}

/// One accepted control connection.
pub trait SbConn: Send {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvStatus>;

    fn send(&mut self, buf: &[u8]) -> io::Result<SendStatus>;
}

/// A bound, listening control endpoint.
pub trait SbListen: Send {
    /// Non-blocking accept; `Ok(None)` when no peer is waiting.
    fn accept(&mut self) -> io::Result<Option<Box<dyn SbConn>>>;
}

/// Abstract-namespace address for a mux: `\0<name>`.
pub fn abstract_addr(name: &str) -> io::Result<UnixAddr> {
    UnixAddr::new_abstract(name.as_bytes()).map_err(io::Error::from)
}

pub struct SeqpacketListener {
    fd: OwnedFd,
    name: String,
}

impl SeqpacketListener {
    /// Create, bind and listen on the abstract address derived from `name`.
    pub fn bind(name: &str) -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = abstract_addr(name)?;
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
        debug!(name, "control socket listening");
        Ok(SeqpacketListener {
            fd,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SbListen for SeqpacketListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn SbConn>>> {
        match accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(raw) => {
                // SAFETY: accept4 returned a fresh descriptor that nothing else owns.
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                Ok(Some(Box::new(SeqpacketConn { fd })))
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct SeqpacketConn {
    fd: OwnedFd,
}

impl SeqpacketConn {
    /// Connect to a listening mux; used by controllers and tests.
    pub fn connect(name: &str) -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        connect(fd.as_raw_fd(), &abstract_addr(name)?)?;
        Ok(SeqpacketConn { fd })
    }

    /// Blocking send of one message.
    pub fn send_msg(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(send(self.fd.as_raw_fd(), buf, MsgFlags::empty())?)
    }

    /// Blocking receive of one message.
    pub fn recv_msg(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())?)
    }
}

impl SbConn for SeqpacketConn {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvStatus> {
        match recv(self.fd.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => Ok(RecvStatus::Closed),
            Ok(n) => Ok(RecvStatus::Data(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(RecvStatus::Empty),
            Err(Errno::ECONNRESET) => Ok(RecvStatus::Closed),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<SendStatus> {
        match send(
            self.fd.as_raw_fd(),
            buf,
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        ) {
            Ok(n) => Ok(SendStatus::Sent(n)),
            Err(Errno::EAGAIN) => Ok(SendStatus::WouldBlock),
            Err(Errno::ECONNRESET) | Err(Errno::EPIPE) => Ok(SendStatus::Reset),
            Err(e) => Err(e.into()),
        }
    }
}
