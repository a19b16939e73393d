//! The mux context: one object owning a multiplexer's registry, uplinks,
//! counters and control channel.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{DEFAULT_BASE_PORT, DEFAULT_PORTS, Encap, MuxConfig};
use crate::control::buffer::{SbTxBuffer, SbTxPool};
use crate::control::handler::{DefaultHandler, MsgHandler};
use crate::control::msg::{self, Ifinfo, Msg};
use crate::control::service::{self, ServiceHandle};
use crate::control::socket::SbListen;
use crate::control::watchers::{EventWatchers, LoggingWatchers, Namespace, NamespaceDirectory};
use crate::counters::{LinkStats, MuxCounter, MuxCounters, MuxFlag, MuxFlags};
use crate::device::{DeviceFactory, NetDevice};
use crate::error::{MuxError, Result};
use crate::proxy::{Proxy, ProxyKind, Xid};
use crate::registry::ProxyRegistry;
use crate::telemetry::{ProxyTelemetry, StatNames, Telemetry};
use crate::uplink::UplinkTable;

pub struct Mux {
    name: String,
    encap: Encap,
    base_port: u8,
    ports: u32,
    device: Arc<dyn NetDevice>,
    stats: LinkStats,
    registry: ProxyRegistry,
    uplinks: UplinkTable,
    counters: Arc<MuxCounters>,
    flags: MuxFlags,
    pool: SbTxPool,
    stat_names: StatNames,
    priv_flag_names: Vec<String>,
    factory: Arc<dyn DeviceFactory>,
    handler: Arc<dyn MsgHandler>,
    watchers: Arc<dyn EventWatchers>,
    namespaces: Arc<dyn NamespaceDirectory>,
    service: Mutex<Option<ServiceHandle>>,
}

/// Builder for creating a Mux
pub struct MuxBuilder {
    device: Arc<dyn NetDevice>,
    name: Option<String>,
    encap: Encap,
    base_port: u8,
    ports: u32,
    stat_names: Vec<String>,
    priv_flag_names: Vec<String>,
    factory: Option<Arc<dyn DeviceFactory>>,
    handler: Option<Arc<dyn MsgHandler>>,
    watchers: Option<Arc<dyn EventWatchers>>,
    namespaces: Option<Arc<dyn NamespaceDirectory>>,
}

impl MuxBuilder {
    pub fn new(device: Arc<dyn NetDevice>) -> Self {
        Self {
            device,
            name: None,
            encap: Encap::Vlan,
            base_port: DEFAULT_BASE_PORT,
            ports: DEFAULT_PORTS,
            stat_names: Vec::new(),
            priv_flag_names: Vec::new(),
            factory: None,
            handler: None,
            watchers: None,
            namespaces: None,
        }
    }

    pub fn from_config(config: &MuxConfig, device: Arc<dyn NetDevice>) -> Self {
        Self::new(device)
            .name(config.name())
            .encap(config.encap)
            .base_port(config.base_port())
            .ports(config.ports())
            .stat_names(config.stats.clone())
            .priv_flag_names(config.priv_flag_names())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn encap(mut self, encap: Encap) -> Self {
        self.encap = encap;
        self
    }

    pub fn base_port(mut self, base_port: u8) -> Self {
        self.base_port = base_port & 1;
        self
    }

    pub fn ports(mut self, ports: u32) -> Self {
        self.ports = ports;
        self
    }

    pub fn stat_names(mut self, names: Vec<String>) -> Self {
        self.stat_names = names;
        self
    }

    pub fn priv_flag_names(mut self, names: Vec<String>) -> Self {
        self.priv_flag_names = names;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn DeviceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MsgHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn watchers(mut self, watchers: Arc<dyn EventWatchers>) -> Self {
        self.watchers = Some(watchers);
        self
    }

    pub fn namespaces(mut self, namespaces: Arc<dyn NamespaceDirectory>) -> Self {
        self.namespaces = Some(namespaces);
        self
    }

    pub fn build(self) -> Result<Arc<Mux>> {
        let stat_names = StatNames::new();
        for name in &self.stat_names {
            stat_names.store(name)?;
        }
        let counters = Arc::new(MuxCounters::new());
        let name = self
            .name
            .unwrap_or_else(|| self.device.name().to_string());

        let mux = Mux {
            name,
            encap: self.encap,
            base_port: self.base_port,
            ports: self.ports,
            device: self.device,
            stats: LinkStats::new(),
            registry: ProxyRegistry::new(),
            uplinks: UplinkTable::new(),
            pool: SbTxPool::new(Arc::clone(&counters)),
            counters,
            flags: MuxFlags::default(),
            stat_names,
            priv_flag_names: self.priv_flag_names,
            factory: self.factory.unwrap_or_else(|| Arc::new(NoDevices)),
            handler: self.handler.unwrap_or_else(|| Arc::new(DefaultHandler)),
            watchers: self
                .watchers
                .unwrap_or_else(|| Arc::new(LoggingWatchers::new())),
            namespaces: self.namespaces.unwrap_or_else(|| Arc::new(NoNamespaces)),
            service: Mutex::new(None),
        };
        info!(
            mux = %mux.name,
            encap = mux.encap.as_str(),
            base_port = mux.base_port,
            ports = mux.ports,
            "mux created"
        );
        Ok(Arc::new(mux))
    }
}

/// Factory used when the embedder provides none; every request fails.
struct NoDevices;

impl DeviceFactory for NoDevices {
    fn create(
        &self,
        _mux: &Arc<Mux>,
        ifname: &str,
        _xid: Xid,
        _kind: ProxyKind,
    ) -> io::Result<Arc<dyn NetDevice>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no device factory for {ifname}"),
        ))
    }
}

struct NoNamespaces;

impl NamespaceDirectory for NoNamespaces {
    fn lookup(&self, _inum: u64) -> Option<Namespace> {
        None
    }
}

impl Mux {
    pub fn builder(device: Arc<dyn NetDevice>) -> MuxBuilder {
        MuxBuilder::new(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encap(&self) -> Encap {
        self.encap
    }

    pub fn base_port(&self) -> u8 {
        self.base_port
    }

    pub fn ports(&self) -> u32 {
        self.ports
    }

    /// The mux's own device.
    pub fn device(&self) -> &Arc<dyn NetDevice> {
        &self.device
    }

    /// Link statistics of the mux device.
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn uplinks(&self) -> &UplinkTable {
        &self.uplinks
    }

    pub fn counters(&self) -> &MuxCounters {
        &self.counters
    }

    pub fn flags(&self) -> &MuxFlags {
        &self.flags
    }

    pub fn pool(&self) -> &SbTxPool {
        &self.pool
    }

    pub fn stat_names(&self) -> &StatNames {
        &self.stat_names
    }

    pub fn priv_flag_names(&self) -> &[String] {
        &self.priv_flag_names
    }

    pub fn watchers(&self) -> &dyn EventWatchers {
        self.watchers.as_ref()
    }

    pub fn namespaces(&self) -> &dyn NamespaceDirectory {
        self.namespaces.as_ref()
    }

    pub fn attach_uplink(&self, dev: Arc<dyn NetDevice>) -> Result<()> {
        self.uplinks.attach(dev)?;
        self.check_lower_carrier();
        Ok(())
    }

    pub fn detach_uplink(&self, dev: &Arc<dyn NetDevice>) -> Result<()> {
        self.uplinks.detach(dev)?;
        self.check_lower_carrier();
        Ok(())
    }

    /// Mux carrier is on iff every attached uplink has carrier.
    pub fn check_lower_carrier(&self) {
        let on = self.uplinks.all_carrier_ok();
        if on != self.device.carrier_ok() {
            debug!(mux = %self.name, carrier = on, "mux carrier changed");
            self.device.set_carrier(on);
        }
    }

    pub fn reset_all_link_stats(&self) {
        self.stats.reset();
        self.registry.reset_all_link_stats();
    }

    pub fn drop_all_port_carrier(&self) {
        self.registry.drop_all_port_carrier();
    }

    /// Create the endpoint device for a new proxy and register it.
    ///
    /// A vlan proxy with a `link` is stacked on that proxy's device. The
    /// identifier must be valid for `kind` (see [`Xid::is_valid_for`]).
    pub fn create_proxy(
        self: &Arc<Self>,
        ifname: &str,
        xid: Xid,
        kind: ProxyKind,
        link: Option<Xid>,
    ) -> Result<Arc<Proxy>> {
        if !xid.is_valid_for(kind) {
            warn!(xid = %xid, kind = kind.as_str(), "identifier out of range");
            return Err(MuxError::InvalidXid {
                xid,
                kind: kind.as_str(),
            });
        }
        if self.registry.lookup_by_id(xid).is_some() {
            return Err(MuxError::XidInUse(xid));
        }
        let lower = match (kind, link) {
            (ProxyKind::Vlan, Some(link)) => {
                let lower = self
                    .registry
                    .lookup_by_id(link)
                    .ok_or(MuxError::UnknownXid(link))?;
                Some(Arc::clone(lower.device()))
            }
            _ => None,
        };

        let device = self
            .factory
            .create(self, ifname, xid, kind)
            .map_err(|e| MuxError::Device(ifname.to_string(), e))?;
        let proxy = Arc::new(match lower {
            Some(lower) => Proxy::vlan(xid, device, lower),
            None => Proxy::new(xid, kind, device),
        });
        if let Err(e) = self.registry.insert(Arc::clone(&proxy)) {
            self.factory.release(proxy.device());
            return Err(e);
        }

        if let Err(e) = self.send_msg(&Msg::Ifinfo(self.ifinfo(&proxy))) {
            warn!(xid = %xid, error = %e, "failed to announce proxy");
        }
        Ok(proxy)
    }

    /// Unregister a proxy; a port or lag takes the vlans stacked on it along.
    pub fn delete_proxy(&self, xid: Xid) -> Result<Vec<Arc<Proxy>>> {
        let proxy = self.registry.remove(xid).ok_or(MuxError::UnknownXid(xid))?;
        let mut removed = self.registry.remove_vlans_of_link(proxy.device());
        removed.push(proxy);
        for p in &removed {
            self.factory.release(p.device());
        }
        Ok(removed)
    }

    pub fn ifinfo(&self, proxy: &Proxy) -> Ifinfo {
        let dev = proxy.device();
        Ifinfo {
            ifname: dev.name().to_string(),
            xid: proxy.xid(),
            kind: proxy.kind(),
            up: dev.is_up(),
            carrier: dev.carrier_ok(),
            link: proxy
                .link()
                .and_then(|l| self.registry.lookup_by_device(l))
                .map(|p| p.xid()),
        }
    }

    /// Replay every proxy in dump order, then a break.
    pub fn dump_ifinfo(&self) -> Result<()> {
        for proxy in self.registry.dump_all() {
            self.send_msg(&Msg::Ifinfo(self.ifinfo(&proxy)))?;
        }
        self.send_msg(&Msg::Break)
    }

    /// Tell the controller about a new network namespace.
    pub fn announce_netns(&self, inum: u64) -> Result<()> {
        self.send_msg(&Msg::NetnsAdd { net: inum })
    }

    /// Encode and queue a message for the controller.
    pub fn send_msg(&self, msg: &Msg) -> Result<()> {
        let buf = self.pool.alloc_from(&msg.encode())?;
        self.enqueue_for_transmit(buf);
        Ok(())
    }

    /// Queue a buffer for the controller, or free it right away when no
    /// controller is connected.
    pub fn enqueue_for_transmit(&self, buf: SbTxBuffer) {
        if self.flags.test(MuxFlag::SbConnection) {
            self.pool.append(buf);
        } else {
            self.pool.free(buf);
        }
    }

    /// Hand one received control message to the message handler.
    pub fn dispatch(self: &Arc<Self>, buf: &[u8]) {
        if let Err(e) = msg::parse_header(buf) {
            self.counters.inc(MuxCounter::SbrxInvalid);
            debug!(error = %e, len = buf.len(), "invalid control message");
            return;
        }
        match self.handler.handle(self, buf) {
            Ok(()) => {}
            Err(MuxError::Msg(e)) => {
                self.counters.inc(MuxCounter::SbrxInvalid);
                debug!(error = %e, "malformed control message");
            }
            Err(e) => warn!(error = %e, "control message rejected"),
        }
    }

    /// Start the control channel on the mux's abstract socket.
    pub fn start_service(self: &Arc<Self>) -> Result<()> {
        self.spawn_service(None)
    }

    /// Start the control channel on a caller-provided listener.
    pub fn start_service_with(self: &Arc<Self>, listener: Box<dyn SbListen>) -> Result<()> {
        self.spawn_service(Some(listener))
    }

    fn spawn_service(self: &Arc<Self>, listener: Option<Box<dyn SbListen>>) -> Result<()> {
        let mut slot = self.service.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(MuxError::AlreadyRunning);
        }
        if let Some(old) = slot.take() {
            old.stop();
        }
        *slot = Some(service::spawn(Arc::clone(self), listener)?);
        Ok(())
    }

    /// Stop the control channel and wait for it to unwind.
    pub fn stop_service(&self) {
        let handle = self
            .service
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.stop();
            info!(mux = %self.name, "control channel stopped");
        }
    }

    pub fn service_running(&self) -> bool {
        self.flags.test(MuxFlag::MainTask)
    }

    /// Stop the control channel, release every uplink and proxy.
    pub fn teardown(&self) {
        self.stop_service();
        for uplink in self.uplinks.detach_all() {
            debug!(uplink = uplink.name(), "uplink released");
        }
        self.device.set_carrier(false);
        for proxy in self.registry.unregister_all() {
            self.factory.release(proxy.device());
        }
        self.pool.drain_tx();
        info!(mux = %self.name, "mux torn down");
    }

    pub fn telemetry(&self) -> Telemetry {
        let proxies = self
            .registry
            .dump_all()
            .iter()
            .map(|p| ProxyTelemetry {
                xid: p.xid().raw(),
                kind: p.kind().as_str(),
                ifname: p.device().name().to_string(),
                up: p.device().is_up(),
                carrier: p.device().carrier_ok(),
                link_stats: p.stats().snapshot().into_iter().collect(),
            })
            .collect();

        Telemetry {
            timestamp: Utc::now(),
            name: self.name.clone(),
            encap: self.encap.as_str(),
            base_port: self.base_port,
            ports: self.ports,
            uplinks: self
                .uplinks
                .uplinks()
                .iter()
                .map(|u| u.name().to_string())
                .collect(),
            counters: self.counters.snapshot().into_iter().collect::<BTreeMap<_, _>>(),
            flags: MuxFlag::ALL
                .iter()
                .filter(|f| self.flags.test(**f))
                .map(|f| f.name())
                .collect(),
            priv_flags: self.priv_flag_names.clone(),
            stat_names: self.stat_names.names(),
            link_stats: self.stats.snapshot().into_iter().collect(),
            proxies,
        }
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("name", &self.name)
            .field("encap", &self.encap)
            .field("proxies", &self.registry.len())
            .field("uplinks", &self.uplinks.len())
            .finish()
    }
}
