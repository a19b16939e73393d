//! TAP-backed devices for the mux itself and for proxy endpoints.
//!
//! Writing to the TAP fd delivers a frame into the host stack as if it
//! arrived on the wire; frames the host sends out of the interface are read
//! back by a reader thread and handed to the mux.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{MAX_FRAME, interface_is_up, set_interface_up, wait_readable};
use crate::device::{DeviceFactory, NetDevice};
use crate::frame::Frame;
use crate::mux::Mux;
use crate::proxy::{ProxyKind, Xid};

/// TAP device errors.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("Failed to open /dev/net/tun: {0}")]
    OpenTun(io::Error),

    #[error("Failed to create TAP device '{0}': {1}")]
    CreateDevice(String, io::Error),

    #[error("TAP name too long: {0} (max 15 chars)")]
    NameTooLong(String),

    #[error("Failed to set interface '{0}' up: {1}")]
    SetUp(String, io::Error),

    #[error("Failed to start reader for '{0}': {1}")]
    Reader(String, io::Error),
}

impl From<TapError> for io::Error {
    fn from(e: TapError) -> Self {
        match e {
            TapError::OpenTun(inner)
            | TapError::CreateDevice(_, inner)
            | TapError::SetUp(_, inner)
            | TapError::Reader(_, inner) => inner,
            e @ TapError::NameTooLong(_) => io::Error::new(io::ErrorKind::InvalidInput, e),
        }
    }
}

const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETCARRIER: libc::c_ulong = 0x400454e2;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TapDevice {
    name: String,
    file: File,
    /// Last known `IFF_UP`; refreshed by the reader on every idle poll.
    up: AtomicBool,
    carrier: AtomicBool,
    closed: AtomicBool,
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name`.
    pub fn create(name: &str) -> Result<Arc<Self>, TapError> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(TapError::NameTooLong(name.to_string()));
        }

        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(TapError::OpenTun(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (dst, &b) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as libc::Ioctl, &ifr) };
        if ret < 0 {
            return Err(TapError::CreateDevice(
                name.to_string(),
                io::Error::last_os_error(),
            ));
        }

        debug!(tap = name, "TAP device created");
        Ok(Arc::new(TapDevice {
            name: name.to_string(),
            file: File::from(fd),
            up: AtomicBool::new(interface_is_up(name)),
            carrier: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn set_up(&self) -> Result<(), TapError> {
        set_interface_up(&self.name).map_err(|e| TapError::SetUp(self.name.clone(), e))?;
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Re-read the administrative state from the kernel.
    pub fn refresh_up(&self) -> bool {
        let up = interface_is_up(&self.name);
        if self.up.swap(up, Ordering::SeqCst) != up {
            debug!(tap = %self.name, up, "admin state changed");
        }
        up
    }

    /// Start a thread feeding every frame the host sends out of this
    /// interface to `sink`. The thread ends after `close`.
    pub fn spawn_reader<F>(self: &Arc<Self>, sink: F) -> Result<JoinHandle<()>, TapError>
    where
        F: Fn(Frame) + Send + 'static,
    {
        let dev = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-rx", self.name))
            .spawn(move || dev.read_loop(sink))
            .map_err(|e| TapError::Reader(self.name.clone(), e))
    }

    fn read_loop<F: Fn(Frame)>(&self, sink: F) {
        let mut buf = vec![0u8; MAX_FRAME];
        while !self.is_closed() {
            match wait_readable(self.file.as_fd()) {
                Ok(true) => {}
                Ok(false) => {
                    self.refresh_up();
                    continue;
                }
                Err(e) => {
                    warn!(tap = %self.name, error = %e, "poll failed");
                    break;
                }
            }
            match (&self.file).read(&mut buf) {
                Ok(0) => {}
                Ok(n) => sink(Frame::new(buf[..n].to_vec())),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(tap = %self.name, error = %e, "read failed");
                    break;
                }
            }
        }
        debug!(tap = %self.name, "reader stopped");
    }

    /// Stop the reader; the interface goes away with the last reference.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let n = (&self.file).write(&frame.to_wire())?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        Ok(())
    }
}

impl NetDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn carrier_ok(&self) -> bool {
        self.carrier.load(Ordering::SeqCst)
    }

    fn set_carrier(&self, on: bool) {
        self.carrier.store(on, Ordering::SeqCst);
        let arg: libc::c_int = on.into();
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), TUNSETCARRIER as libc::Ioctl, &arg) };
        if ret < 0 {
            debug!(tap = %self.name, error = %io::Error::last_os_error(), "TUNSETCARRIER failed");
        }
    }

    fn transmit(&self, frame: Frame) -> io::Result<()> {
        self.write_frame(&frame)
    }

    fn forward(&self, frame: Frame) -> io::Result<()> {
        self.write_frame(&frame)
    }
}

/// Creates one TAP interface per proxy; frames the host sends out of it are
/// encapsulated by the mux.
#[derive(Default)]
pub struct TapFactory {
    devices: Mutex<HashMap<String, Arc<TapDevice>>>,
}

impl TapFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceFactory for TapFactory {
    fn create(
        &self,
        mux: &Arc<Mux>,
        ifname: &str,
        xid: Xid,
        kind: ProxyKind,
    ) -> io::Result<Arc<dyn NetDevice>> {
        let dev = TapDevice::create(ifname)?;
        let weak = Arc::downgrade(mux);
        dev.spawn_reader(move |frame| {
            if let Some(mux) = weak.upgrade() {
                mux.proxy_xmit(xid, frame);
            }
        })?;
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ifname.to_string(), Arc::clone(&dev));
        info!(tap = ifname, xid = %xid, kind = kind.as_str(), "proxy device created");
        Ok(dev)
    }

    fn release(&self, device: &Arc<dyn NetDevice>) {
        let dev = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device.name());
        if let Some(dev) = dev {
            dev.close();
            info!(tap = %device.name(), "proxy device released");
        }
    }
}
