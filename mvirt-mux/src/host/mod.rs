//! Host devices backing a running mux: TAP endpoints for the mux and its
//! proxies, AF_PACKET uplinks, and the `/proc` namespace directory.

pub mod netns;
pub mod packet;
pub mod tap;

pub use netns::ProcNamespaces;
pub use packet::PacketUplink;
pub use tap::{TapDevice, TapError, TapFactory};

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

/// Reader threads wake this often to notice a close.
pub(crate) const READ_POLL_MS: u16 = 100;

/// Largest frame read from a host device.
pub(crate) const MAX_FRAME: usize = 9728;

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {name}"),
        ));
    }
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, &b) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = b as libc::c_char;
    }
    Ok(ifr)
}

/// Interface flags (`SIOCGIFFLAGS`) of `name`.
pub(crate) fn interface_flags(name: &str) -> io::Result<libc::c_short> {
    let mut ifr = ifreq_for(name)?;
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as libc::Ioctl, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { ifr.ifr_ifru.ifru_flags })
}

/// Set `IFF_UP` on `name`.
pub(crate) fn set_interface_up(name: &str) -> io::Result<()> {
    let flags = interface_flags(name)?;
    let mut ifr = ifreq_for(name)?;
    ifr.ifr_ifru.ifru_flags = flags | libc::IFF_UP as libc::c_short;

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(sock) };
    let ret = unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as libc::Ioctl, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn interface_is_up(name: &str) -> bool {
    interface_flags(name).is_ok_and(|f| f & libc::IFF_UP as libc::c_short != 0)
}

/// Interface index for an existing interface.
pub(crate) fn if_index(name: &str) -> io::Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

/// Wait up to `READ_POLL_MS` for `fd` to become readable.
pub(crate) fn wait_readable(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(READ_POLL_MS)) {
        Ok(n) => Ok(n > 0),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
