//! Proxies: virtual endpoints multiplexed over the mux, and their identifiers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::counters::LinkStats;
use crate::device::NetDevice;
use crate::error::MuxError;
use crate::frame::{VLAN_VID_MASK, vid_is_exception};

/// Bit position of the stacked tag's VID within an identifier.
pub const XID_VID_BIT: u32 = 12;

/// Largest identifier of a single-tagged proxy.
pub const XID_MAX_SINGLE: u32 = 0x0ffe;

/// Largest identifier of a stacked vlan proxy.
pub const XID_MAX: u32 = 0x00ff_ffff;

/// Compact proxy identifier assembled from one or two VLAN VIDs.
///
/// The low 12 bits carry the outer tag's VID; a stacked inner tag's VID is
/// shifted into bits 12..24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid(pub u32);

impl Xid {
    pub fn new(raw: u32) -> Self {
        Xid(raw)
    }

    /// Assemble an identifier from the outer VID and an optional stacked VID.
    pub fn from_vids(low: u16, high: Option<u16>) -> Self {
        let mut xid = u32::from(low & VLAN_VID_MASK);
        if let Some(high) = high {
            xid |= u32::from(high & VLAN_VID_MASK) << XID_VID_BIT;
        }
        Xid(xid)
    }

    #[inline]
    pub fn low_vid(self) -> u16 {
        (self.0 & u32::from(VLAN_VID_MASK)) as u16
    }

    #[inline]
    pub fn high_vid(self) -> u16 {
        ((self.0 >> XID_VID_BIT) & u32::from(VLAN_VID_MASK)) as u16
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// True if frames tagged for this identifier demultiplex back to it.
    ///
    /// Only vlan proxies push a stacked tag, so every other kind is limited
    /// to one VID. No kind may use an exception VID as its outer tag.
    pub fn is_valid_for(self, kind: ProxyKind) -> bool {
        let max = match kind {
            ProxyKind::Vlan => XID_MAX,
            _ => XID_MAX_SINGLE,
        };
        self.0 <= max && !vid_is_exception(self.low_vid())
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of endpoint a proxy represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Port,
    Vlan,
    Bridge,
    Lag,
    #[serde(rename = "lb")]
    LoadBalancer,
}

impl ProxyKind {
    pub const COUNT: usize = 5;

    /// Order used when replaying every proxy to the controller.
    pub const DUMP_ORDER: [ProxyKind; Self::COUNT] = [
        ProxyKind::LoadBalancer,
        ProxyKind::Port,
        ProxyKind::Lag,
        ProxyKind::Vlan,
        ProxyKind::Bridge,
    ];

    /// Order used when unregistering everything on teardown.
    pub const TEARDOWN_ORDER: [ProxyKind; Self::COUNT] = [
        ProxyKind::Bridge,
        ProxyKind::Vlan,
        ProxyKind::Lag,
        ProxyKind::Port,
        ProxyKind::LoadBalancer,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            ProxyKind::Port => 0,
            ProxyKind::Vlan => 1,
            ProxyKind::Bridge => 2,
            ProxyKind::Lag => 3,
            ProxyKind::LoadBalancer => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Port => "port",
            ProxyKind::Vlan => "vlan",
            ProxyKind::Bridge => "bridge",
            ProxyKind::Lag => "lag",
            ProxyKind::LoadBalancer => "lb",
        }
    }
}

/// Wire values; 0 is "unspecified" and always rejected.
impl TryFrom<u8> for ProxyKind {
    type Error = MuxError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(ProxyKind::Port),
            2 => Ok(ProxyKind::Vlan),
            3 => Ok(ProxyKind::Bridge),
            4 => Ok(ProxyKind::Lag),
            5 => Ok(ProxyKind::LoadBalancer),
            _ => Err(MuxError::InvalidKind(v)),
        }
    }
}

impl From<ProxyKind> for u8 {
    fn from(kind: ProxyKind) -> u8 {
        match kind {
            ProxyKind::Port => 1,
            ProxyKind::Vlan => 2,
            ProxyKind::Bridge => 3,
            ProxyKind::Lag => 4,
            ProxyKind::LoadBalancer => 5,
        }
    }
}

/// A virtual endpoint registered with a mux.
pub struct Proxy {
    xid: Xid,
    kind: ProxyKind,
    /// Lower device a vlan proxy is stacked on.
    link: Option<Arc<dyn NetDevice>>,
    device: Arc<dyn NetDevice>,
    stats: LinkStats,
}

impl Proxy {
    pub fn new(xid: Xid, kind: ProxyKind, device: Arc<dyn NetDevice>) -> Self {
        Proxy {
            xid,
            kind,
            link: None,
            device,
            stats: LinkStats::new(),
        }
    }

    /// Create a vlan proxy stacked on `link`.
    pub fn vlan(xid: Xid, device: Arc<dyn NetDevice>, link: Arc<dyn NetDevice>) -> Self {
        Proxy {
            link: Some(link),
            ..Proxy::new(xid, ProxyKind::Vlan, device)
        }
    }

    pub fn xid(&self) -> Xid {
        self.xid
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn device(&self) -> &Arc<dyn NetDevice> {
        &self.device
    }

    pub fn link(&self) -> Option<&Arc<dyn NetDevice>> {
        self.link.as_ref()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn is_device(&self, dev: &Arc<dyn NetDevice>) -> bool {
        same_device(&self.device, dev)
    }

    /// True if this is a vlan proxy stacked on `dev`.
    pub fn has_link(&self, dev: &Arc<dyn NetDevice>) -> bool {
        self.kind == ProxyKind::Vlan && self.link.as_ref().is_some_and(|l| same_device(l, dev))
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("xid", &self.xid)
            .field("kind", &self.kind)
            .field("device", &self.device.name())
            .field("link", &self.link.as_ref().map(|l| l.name().to_string()))
            .finish()
    }
}

/// Device identity is object identity.
pub fn same_device(a: &Arc<dyn NetDevice>, b: &Arc<dyn NetDevice>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
