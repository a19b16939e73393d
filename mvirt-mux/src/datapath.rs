//! Frame path: demultiplexing tagged frames from the uplinks to proxies and
//! encapsulating proxy frames toward the uplinks.
//!
//! Nothing here blocks or fails; every drop is counted in link statistics.

use std::sync::Arc;

use tracing::trace;

use crate::config::Encap;
use crate::counters::{LinkStat, MuxCounter};
use crate::device::NetDevice;
use crate::frame::{ETH_P_8021AD, ETH_P_8021Q, Frame, VLAN_PRIO_MASK, VlanTag};
use crate::mux::Mux;
use crate::proxy::{Proxy, ProxyKind, Xid};

impl Mux {
    /// Entry point for frames read from an uplink.
    ///
    /// Frames from a device that is no longer hooked are ignored.
    pub fn receive_from_uplink(&self, uplink: &Arc<dyn NetDevice>, frame: Frame) {
        if !self.uplinks().is_attached(uplink) {
            trace!(uplink = uplink.name(), "frame from unhooked device");
            return;
        }
        self.demux(frame);
    }

    /// Demultiplex one inbound frame to its proxy.
    pub fn demux(&self, frame: Frame) {
        let ls = self.stats();
        let Some(outer) = frame.outer_tag() else {
            trace!(len = frame.len(), "untagged frame on uplink");
            ls.inc(LinkStat::RxErrors);
            ls.inc(LinkStat::RxFrameErrors);
            return;
        };
        if outer.is_exception() {
            self.deliver_exception(outer, frame);
            return;
        }

        let Ok((outer, frame)) = frame.pop_tag() else {
            return;
        };
        // A stacked inner tag folds its VID into the identifier.
        let (high, frame) = match frame.pop_tag() {
            Ok((inner, frame)) => (Some(inner.vid()), frame),
            Err(frame) => (None, frame),
        };
        let xid = Xid::from_vids(outer.vid(), high);
        let frame = frame.with_priority(outer.priority()).with_vlan(None);

        let Some(proxy) = self.registry().lookup_by_id(xid) else {
            trace!(xid = %xid, tci = outer.tci, "no proxy for identifier");
            ls.inc(LinkStat::RxErrors);
            ls.inc(LinkStat::RxNohandler);
            return;
        };
        if !proxy.device().is_up() {
            ls.inc(LinkStat::RxDropped);
            proxy.stats().inc(LinkStat::RxDropped);
            return;
        }

        let len = frame.len() as u64;
        match proxy.device().forward(frame) {
            Ok(()) => {
                ls.inc(LinkStat::RxPackets);
                ls.add(LinkStat::RxBytes, len);
                proxy.stats().inc(LinkStat::RxPackets);
                proxy.stats().add(LinkStat::RxBytes, len);
            }
            Err(e) => {
                trace!(xid = %xid, error = %e, "proxy forward failed");
                ls.inc(LinkStat::RxDropped);
                proxy.stats().inc(LinkStat::RxDropped);
            }
        }
    }

    /// Encapsulate a frame sent by `proxy` and transmit it through the mux.
    pub fn encap_xmit(&self, proxy: &Proxy, frame: Frame) {
        if self.encap() == Encap::Vpls {
            proxy.stats().inc(LinkStat::TxDropped);
            return;
        }

        let xid = proxy.xid();
        let tagged = match proxy.kind() {
            ProxyKind::Vlan => frame
                .push_tag(VlanTag::new(ETH_P_8021Q, xid.high_vid()))
                .and_then(|f| f.push_tag(VlanTag::new(ETH_P_8021AD, xid.low_vid()))),
            _ => frame.push_tag(VlanTag::new(ETH_P_8021Q, xid.low_vid())),
        };
        let Some(frame) = tagged else {
            trace!(xid = %xid, "tag insertion failed");
            proxy.stats().inc(LinkStat::TxErrors);
            proxy.stats().inc(LinkStat::TxDropped);
            return;
        };

        if !self.device().is_up() {
            let ls = self.stats();
            ls.inc(LinkStat::TxErrors);
            ls.inc(LinkStat::TxCarrierErrors);
            return;
        }
        proxy.stats().inc(LinkStat::TxPackets);
        proxy.stats().add(LinkStat::TxBytes, frame.len() as u64);
        self.xmit(frame);
    }

    /// Encapsulate a frame sent by the proxy with identifier `xid`.
    pub fn proxy_xmit(&self, xid: Xid, frame: Frame) {
        match self.registry().lookup_by_id(xid) {
            Some(proxy) => self.encap_xmit(&proxy, frame),
            None => trace!(xid = %xid, "frame from unregistered proxy"),
        }
    }

    /// Transmit a tagged frame on the mux device.
    ///
    /// Exception-tagged frames are delivered locally. Others go to the
    /// uplink selected by the low VID bit, or loop back to the mux
    /// device when no uplink is attached.
    pub fn xmit(&self, frame: Frame) {
        let ls = self.stats();
        if self.encap() == Encap::Vpls {
            ls.inc(LinkStat::TxDropped);
            return;
        }

        let outer = frame.outer_tag();
        if let Some(tag) = outer
            && tag.is_exception()
        {
            self.deliver_exception(tag, frame);
            return;
        }

        let hash = outer.map_or(0, |t| usize::from(t.vid() & 1));
        let len = frame.len() as u64;
        match self.uplinks().select(hash) {
            Some(uplink) if uplink.is_up() => match uplink.transmit(frame) {
                Ok(()) => {
                    ls.inc(LinkStat::TxPackets);
                    ls.add(LinkStat::TxBytes, len);
                }
                Err(e) => {
                    trace!(uplink = uplink.name(), error = %e, "uplink transmit failed");
                    ls.inc(LinkStat::TxDropped);
                }
            },
            Some(uplink) => {
                trace!(uplink = uplink.name(), "uplink down");
                ls.inc(LinkStat::TxErrors);
                ls.inc(LinkStat::TxHeartbeatErrors);
            }
            None => match self.device().forward(frame) {
                Ok(()) => {
                    ls.inc(LinkStat::RxPackets);
                    ls.add(LinkStat::RxBytes, len);
                }
                Err(e) => {
                    trace!(error = %e, "loopback delivery failed");
                    ls.inc(LinkStat::TxErrors);
                    ls.inc(LinkStat::TxAbortedErrors);
                }
            },
        }
    }

    /// Deliver a frame carrying a reserved VID to the mux device itself,
    /// with the tag moved out of band and its priority bits cleared.
    fn deliver_exception(&self, tag: VlanTag, frame: Frame) {
        self.counters().inc(MuxCounter::ExFrames);
        self.counters().add(MuxCounter::ExBytes, frame.len() as u64);

        let Ok((_, frame)) = frame.pop_tag() else {
            return;
        };
        let frame = frame.with_priority(tag.priority()).with_vlan(Some(VlanTag {
            tpid: tag.tpid,
            tci: tag.tci & !VLAN_PRIO_MASK,
        }));

        let ls = self.stats();
        let len = frame.len() as u64;
        match self.device().forward(frame) {
            Ok(()) => {
                ls.inc(LinkStat::RxPackets);
                ls.add(LinkStat::RxBytes, len);
            }
            Err(e) => {
                trace!(error = %e, "exception delivery failed");
                ls.inc(LinkStat::RxDropped);
            }
        }
    }
}
