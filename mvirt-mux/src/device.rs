//! Device abstraction at the frame-path boundary.
//!
//! The mux never owns a network stack; it hands frames to devices through
//! two fallible primitives: `transmit` (queue for egress, used for uplinks)
//! and `forward` (local delivery into the device's receive path, used for
//! proxies and the mux device itself).

use std::io;
use std::sync::Arc;

use crate::frame::Frame;
use crate::mux::Mux;
use crate::proxy::{ProxyKind, Xid};

pub trait NetDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Administrative up state.
    fn is_up(&self) -> bool;

    fn carrier_ok(&self) -> bool;

    fn set_carrier(&self, on: bool);

    fn is_loopback(&self) -> bool {
        false
    }

    /// Adjust the promiscuity count by `inc`.
    fn set_promiscuity(&self, _inc: i32) -> io::Result<()> {
        Ok(())
    }

    /// Queue a frame for egress.
    fn transmit(&self, frame: Frame) -> io::Result<()>;

    /// Deliver a frame into the device's receive path.
    fn forward(&self, frame: Frame) -> io::Result<()>;
}

/// Creates the endpoint device behind a proxy the controller asked for.
///
/// The mux is passed so the device can feed frames it reads back into
/// `Mux::encap_xmit`.
pub trait DeviceFactory: Send + Sync {
    fn create(
        &self,
        mux: &Arc<Mux>,
        ifname: &str,
        xid: Xid,
        kind: ProxyKind,
    ) -> io::Result<Arc<dyn NetDevice>>;

    /// Called once the proxy is gone from the registry.
    fn release(&self, _device: &Arc<dyn NetDevice>) {}
}
