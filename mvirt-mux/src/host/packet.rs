//! AF_PACKET uplinks.
//!
//! Received frames carry their outer tag out of band (the NIC may have
//! stripped it); `PACKET_AUXDATA` gives it back and the tag is reinserted
//! before the frame reaches the demultiplexer.

use std::io;
use std::mem::{size_of, size_of_val};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use super::{MAX_FRAME, if_index, interface_is_up, wait_readable};
use crate::device::NetDevice;
use crate::frame::{ETH_P_8021Q, Frame, VlanTag};
use crate::mux::Mux;

const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
const PACKET_DROP_MEMBERSHIP: libc::c_int = 2;
const PACKET_AUXDATA: libc::c_int = 8;
const PACKET_MR_PROMISC: libc::c_ushort = 1;
const PACKET_OUTGOING: u8 = 4;

const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
const TP_STATUS_VLAN_TPID_VALID: u32 = 1 << 6;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct AuxData {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
}

#[repr(C)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [u8; 8],
}

/// A host interface used as an uplink through a raw packet socket.
pub struct PacketUplink {
    name: String,
    if_index: u32,
    socket: Socket,
    promisc: Mutex<i32>,
    /// Last known `IFF_UP`; refreshed by the reader on every idle poll.
    up: AtomicBool,
    carrier_override: AtomicBool,
    closed: AtomicBool,
}

impl PacketUplink {
    /// Open a packet socket bound to interface `name`.
    pub fn open(name: &str) -> io::Result<Arc<Self>> {
        let if_index = if_index(name)?;
        let eth_p_all = (libc::ETH_P_ALL as u16).to_be();
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW.cloexec(),
            Some(Protocol::from(libc::c_int::from(eth_p_all))),
        )?;
        socket.set_nonblocking(true)?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = eth_p_all;
        addr.sll_ifindex = if_index as i32;
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let on: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_AUXDATA,
                &on as *const libc::c_int as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        debug!(uplink = name, if_index, "packet socket bound");
        Ok(Arc::new(PacketUplink {
            name: name.to_string(),
            if_index,
            socket,
            promisc: Mutex::new(0),
            up: AtomicBool::new(interface_is_up(name)),
            carrier_override: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Re-read the administrative state from the kernel.
    pub fn refresh_up(&self) -> bool {
        let up = interface_is_up(&self.name);
        if self.up.swap(up, Ordering::SeqCst) != up {
            info!(uplink = %self.name, up, "uplink admin state changed");
        }
        up
    }

    /// Start a thread feeding received frames to `mux`. The thread ends
    /// after `close`.
    pub fn spawn_reader(self: &Arc<Self>, mux: &Arc<Mux>) -> io::Result<JoinHandle<()>> {
        let dev = Arc::clone(self);
        let weak = Arc::downgrade(mux);
        thread::Builder::new()
            .name(format!("{}-rx", self.name))
            .spawn(move || {
                let hook: Arc<dyn NetDevice> = dev.clone();
                let mut buf = vec![0u8; MAX_FRAME];
                while !dev.closed.load(Ordering::SeqCst) {
                    match wait_readable(dev.socket.as_fd()) {
                        Ok(true) => {}
                        Ok(false) => {
                            dev.refresh_up();
                            continue;
                        }
                        Err(e) => {
                            warn!(uplink = %dev.name, error = %e, "poll failed");
                            break;
                        }
                    }
                    match dev.recv_frame(&mut buf) {
                        Ok(Some(frame)) => match weak.upgrade() {
                            Some(mux) => mux.receive_from_uplink(&hook, frame),
                            None => break,
                        },
                        Ok(None) => {}
                        Err(e) => {
                            warn!(uplink = %dev.name, error = %e, "receive failed");
                            break;
                        }
                    }
                }
                debug!(uplink = %dev.name, "reader stopped");
            })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Receive one frame, reinserting an offloaded tag. Frames we sent
    /// ourselves are skipped.
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<Option<Frame>> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut control = [0u64; 8];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&mut addr as *mut libc::sockaddr_ll).cast();
        msg.msg_namelen = size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = size_of_val(&control) as _;

        let n = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
        if n < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(e),
            };
        }
        if addr.sll_pkttype == PACKET_OUTGOING {
            return Ok(None);
        }

        let mut aux = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::SOL_PACKET && hdr.cmsg_type == PACKET_AUXDATA {
                aux = Some(unsafe {
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const AuxData)
                });
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        let frame = Frame::new(buf[..n as usize].to_vec());
        Ok(match aux.and_then(offloaded_tag) {
            Some(tag) => {
                let frame = frame.push_tag(tag);
                if frame.is_none() {
                    trace!(uplink = %self.name, "runt frame with offloaded tag");
                }
                frame
            }
            None => Some(frame),
        })
    }

    fn membership(&self, op: libc::c_int) -> io::Result<()> {
        let mreq = PacketMreq {
            mr_ifindex: self.if_index as libc::c_int,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_PACKET,
                op,
                &mreq as *const PacketMreq as *const libc::c_void,
                size_of::<PacketMreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn offloaded_tag(aux: AuxData) -> Option<VlanTag> {
    if aux.tp_status & TP_STATUS_VLAN_VALID == 0 {
        return None;
    }
    let tpid = if aux.tp_status & TP_STATUS_VLAN_TPID_VALID != 0 {
        aux.tp_vlan_tpid
    } else {
        ETH_P_8021Q
    };
    Some(VlanTag {
        tpid,
        tci: aux.tp_vlan_tci,
    })
}

impl NetDevice for PacketUplink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn carrier_ok(&self) -> bool {
        if !self.carrier_override.load(Ordering::SeqCst) {
            return false;
        }
        std::fs::read_to_string(format!("/sys/class/net/{}/carrier", self.name))
            .is_ok_and(|s| s.trim() == "1")
    }

    fn set_carrier(&self, on: bool) {
        self.carrier_override.store(on, Ordering::SeqCst);
    }

    fn set_promiscuity(&self, inc: i32) -> io::Result<()> {
        let mut count = self.promisc.lock().unwrap_or_else(|e| e.into_inner());
        let next = (*count + inc).max(0);
        match (*count, next) {
            (0, n) if n > 0 => self.membership(PACKET_ADD_MEMBERSHIP)?,
            (c, 0) if c > 0 => self.membership(PACKET_DROP_MEMBERSHIP)?,
            _ => {}
        }
        if next != *count {
            info!(uplink = %self.name, promiscuity = next, "promiscuity changed");
        }
        *count = next;
        Ok(())
    }

    fn transmit(&self, frame: Frame) -> io::Result<()> {
        self.socket.send(&frame.to_wire())?;
        Ok(())
    }

    fn forward(&self, _frame: Frame) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "uplinks only transmit",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ETH_P_8021AD;

    #[test]
    fn test_offloaded_tag() {
        let mut aux = AuxData {
            tp_vlan_tci: (3 << 13) | 100,
            ..AuxData::default()
        };
        assert_eq!(offloaded_tag(aux), None);

        aux.tp_status = TP_STATUS_VLAN_VALID;
        let tag = offloaded_tag(aux).unwrap();
        assert_eq!(tag.tpid, ETH_P_8021Q);
        assert_eq!(tag.vid(), 100);
        assert_eq!(tag.priority(), 3);

        aux.tp_status |= TP_STATUS_VLAN_TPID_VALID;
        aux.tp_vlan_tpid = ETH_P_8021AD;
        assert_eq!(offloaded_tag(aux).unwrap().tpid, ETH_P_8021AD);
    }

    #[test]
    fn test_loopback_admin_state_is_cached() {
        if !nix::unistd::Uid::effective().is_root() {
            eprintln!("Skipping test: requires root privileges");
            return;
        }
        let lo = PacketUplink::open("lo").unwrap();
        assert!(lo.is_up());
        assert!(lo.refresh_up());
        assert!(lo.is_up());
        lo.close();
    }

    #[test]
    fn test_open_unknown_interface() {
        assert!(PacketUplink::open("no-such-if0").is_err());
    }
}
