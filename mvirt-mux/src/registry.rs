//! Proxy registry.
//!
//! Lookups run on every demultiplexed frame, so reads are lock-free: the
//! registry publishes an immutable snapshot through `ArcSwap` and writers
//! (serialized by a mutex) build a modified copy and swap it in. A reader
//! that loaded the previous snapshot keeps it, and every proxy in it, alive
//! until it drops its guard; a removed proxy is therefore never observed
//! after it has been freed, and no new lookup can find it once `remove`
//! has returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, error};

use crate::device::NetDevice;
use crate::error::{MuxError, Result};
use crate::proxy::{Proxy, ProxyKind, Xid};

#[derive(Clone, Default)]
struct Snapshot {
    by_xid: HashMap<Xid, Arc<Proxy>>,
    /// One ordered list per kind, indexed by `ProxyKind::index`.
    kinds: [Vec<Arc<Proxy>>; ProxyKind::COUNT],
}

impl Snapshot {
    fn kind(&self, kind: ProxyKind) -> &[Arc<Proxy>] {
        &self.kinds[kind.index()]
    }
}

pub struct ProxyRegistry {
    current: ArcSwap<Snapshot>,
    writer: Mutex<()>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        ProxyRegistry {
            current: ArcSwap::from_pointee(Snapshot::default()),
            writer: Mutex::new(()),
        }
    }

    /// Add a proxy to the identifier index and its kind list.
    ///
    /// Identifiers are unique per mux: a second proxy with a live
    /// identifier is rejected and the registry is left unchanged.
    pub fn insert(&self, proxy: Arc<Proxy>) -> Result<()> {
        let _w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load();
        if current.by_xid.contains_key(&proxy.xid()) {
            error!(xid = %proxy.xid(), kind = proxy.kind().as_str(), "identifier in use");
            return Err(MuxError::XidInUse(proxy.xid()));
        }
        let mut next = Snapshot::clone(&current);
        next.by_xid.insert(proxy.xid(), Arc::clone(&proxy));
        next.kinds[proxy.kind().index()].push(Arc::clone(&proxy));
        self.current.store(Arc::new(next));
        debug!(xid = %proxy.xid(), kind = proxy.kind().as_str(), "proxy registered");
        Ok(())
    }

    /// Remove a proxy from both the index and its kind list.
    ///
    /// Returns the removed entry. Readers that still hold it keep it alive.
    pub fn remove(&self, xid: Xid) -> Option<Arc<Proxy>> {
        let _w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load();
        let proxy = current.by_xid.get(&xid).cloned()?;
        let mut next = Snapshot::clone(&current);
        next.by_xid.remove(&xid);
        next.kinds[proxy.kind().index()].retain(|p| !Arc::ptr_eq(p, &proxy));
        self.current.store(Arc::new(next));
        debug!(xid = %xid, kind = proxy.kind().as_str(), "proxy unregistered");
        Some(proxy)
    }

    /// Fast-path lookup by identifier.
    #[inline]
    pub fn lookup_by_id(&self, xid: Xid) -> Option<Arc<Proxy>> {
        self.current.load().by_xid.get(&xid).cloned()
    }

    /// Cold-path lookup by endpoint device; scans every kind list.
    pub fn lookup_by_device(&self, dev: &Arc<dyn NetDevice>) -> Option<Arc<Proxy>> {
        let snap = self.current.load();
        snap.kinds
            .iter()
            .flat_map(|list| list.iter())
            .find(|p| p.is_device(dev))
            .cloned()
    }

    /// Visit every proxy of the given kinds, in order, over one consistent snapshot.
    pub fn for_each_in<F>(&self, order: &[ProxyKind], mut f: F)
    where
        F: FnMut(&Arc<Proxy>),
    {
        let snap = self.current.load_full();
        for kind in order {
            for proxy in snap.kind(*kind) {
                f(proxy);
            }
        }
    }

    pub fn proxies_of(&self, kind: ProxyKind) -> Vec<Arc<Proxy>> {
        self.current.load().kind(kind).to_vec()
    }

    /// All proxies in dump order: lbs, ports, lags, vlans, bridges.
    pub fn dump_all(&self) -> Vec<Arc<Proxy>> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each_in(&ProxyKind::DUMP_ORDER, |p| out.push(Arc::clone(p)));
        out
    }

    pub fn reset_all_link_stats(&self) {
        self.for_each_in(&ProxyKind::DUMP_ORDER, |p| p.stats().reset());
    }

    pub fn drop_all_port_carrier(&self) {
        self.for_each_in(&[ProxyKind::Port], |p| p.device().set_carrier(false));
    }

    /// Vlan proxies stacked on `link`.
    pub fn vlans_of_link(&self, link: &Arc<dyn NetDevice>) -> Vec<Arc<Proxy>> {
        let snap = self.current.load();
        snap.kind(ProxyKind::Vlan)
            .iter()
            .filter(|p| p.has_link(link))
            .cloned()
            .collect()
    }

    /// Unregister every vlan proxy stacked on `link`.
    pub fn remove_vlans_of_link(&self, link: &Arc<dyn NetDevice>) -> Vec<Arc<Proxy>> {
        self.vlans_of_link(link)
            .into_iter()
            .filter_map(|p| self.remove(p.xid()))
            .collect()
    }

    /// Set carrier on `dev` and on every vlan stacked on it.
    pub fn change_carrier(&self, dev: &Arc<dyn NetDevice>, on: bool) {
        dev.set_carrier(on);
        for vlan in self.vlans_of_link(dev) {
            vlan.device().set_carrier(on);
        }
    }

    /// Unregister every proxy: bridges, vlans, lags, ports, lbs.
    pub fn unregister_all(&self) -> Vec<Arc<Proxy>> {
        let _w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.current.swap(Arc::new(Snapshot::default()));
        let mut removed = Vec::with_capacity(old.by_xid.len());
        for kind in ProxyKind::TEARDOWN_ORDER {
            removed.extend(old.kind(kind).iter().cloned());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.current.load().by_xid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
