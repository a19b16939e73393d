//! mvirt-mux: a virtual network multiplexer.
//!
//! One mux device stands for a switch reached over up to eight uplinks.
//! Proxies (ports, vlans, bridges, lags, load balancers) are virtual
//! endpoints identified by VLAN ids; frames are demultiplexed to them by
//! tag and encapsulated back toward the uplinks. A userspace controller
//! manages proxies over a `SOCK_SEQPACKET` control channel.
//!
//! # Architecture
//!
//! ```text
//! uplink (tagged) --> demux --> proxy device
//! proxy device --> encap_xmit --> xmit --> uplink[vid & 1]
//!                                    |
//!                                    +--> mux device (exception VIDs, no uplink)
//!
//! controller <--@<mux name>--> control service --> registry / message pool
//! ```

pub mod config;
pub mod control;
pub mod counters;
pub mod datapath;
pub mod device;
pub mod error;
pub mod frame;
pub mod host;
pub mod mux;
pub mod proxy;
pub mod registry;
pub mod telemetry;
pub mod uplink;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use config::{Encap, MuxConfig};
pub use counters::{LinkStat, LinkStats, MuxCounter, MuxCounters, MuxFlag, MuxFlags};
pub use device::{DeviceFactory, NetDevice};
pub use error::{MuxError, Result};
pub use frame::{Frame, VlanTag};
pub use mux::{Mux, MuxBuilder};
pub use proxy::{Proxy, ProxyKind, Xid};
pub use registry::ProxyRegistry;
pub use telemetry::{StatNames, Telemetry};
pub use uplink::{UPLINK_SLOTS, UplinkTable};
