//! Dispatch of received control messages.

use std::sync::Arc;

use tracing::{debug, info};

use super::msg::Msg;
use crate::error::{MuxError, Result};
use crate::mux::Mux;
use crate::proxy::ProxyKind;

/// Decodes and applies one received control message.
pub trait MsgHandler: Send + Sync {
    fn handle(&self, mux: &Arc<Mux>, buf: &[u8]) -> Result<()>;
}

/// Applies the controller's requests to the registry. Endpoint devices
/// come from the mux's `DeviceFactory`.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl MsgHandler for DefaultHandler {
    fn handle(&self, mux: &Arc<Mux>, buf: &[u8]) -> Result<()> {
        let msg = Msg::decode(buf)?;
        debug!(kind = ?msg.kind(), "control message");
        match msg {
            Msg::Break => Ok(()),
            Msg::DumpIfinfo => mux.dump_ifinfo(),
            Msg::Carrier { xid, on } => {
                let proxy = mux.registry().lookup_by_id(xid).ok_or(MuxError::UnknownXid(xid))?;
                mux.registry().change_carrier(proxy.device(), on);
                Ok(())
            }
            Msg::LinkStat { xid, stat, count } => {
                let proxy = mux.registry().lookup_by_id(xid).ok_or(MuxError::UnknownXid(xid))?;
                proxy.stats().set(stat, count);
                Ok(())
            }
            Msg::ProxyAdd {
                ifname,
                xid,
                kind,
                link,
            } => {
                let kind = ProxyKind::try_from(kind)?;
                let proxy = mux.create_proxy(&ifname, xid, kind, link)?;
                info!(xid = %proxy.xid(), kind = kind.as_str(), ifname = %ifname, "proxy added");
                Ok(())
            }
            Msg::ProxyDel { xid } => {
                mux.delete_proxy(xid)?;
                info!(xid = %xid, "proxy deleted");
                Ok(())
            }
            // Sent by the mux, never received.
            msg @ (Msg::Ifinfo(_) | Msg::NetnsAdd { .. } | Msg::NetnsDel { .. }) => {
                debug!(kind = ?msg.kind(), "ignoring outbound-only message");
                Ok(())
            }
        }
    }
}
