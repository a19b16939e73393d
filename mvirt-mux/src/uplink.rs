//! Uplink attachment and the fixed-size slot table used for egress selection.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::device::NetDevice;
use crate::error::{MuxError, Result};
use crate::proxy::same_device;

pub const UPLINK_SLOTS: usize = 8;

type Slots = [Option<Arc<dyn NetDevice>>; UPLINK_SLOTS];

/// Attached uplinks plus the slot table derived from them.
///
/// `hooks` is the frame-interception hook: a frame read from a device is
/// only demultiplexed while that device is hooked. Writers serialize on
/// `attached`; the datapath only reads the two published snapshots.
pub struct UplinkTable {
    attached: Mutex<Vec<Arc<dyn NetDevice>>>,
    hooks: ArcSwap<Vec<Arc<dyn NetDevice>>>,
    slots: ArcSwap<Slots>,
}

impl UplinkTable {
    pub fn new() -> Self {
        UplinkTable {
            attached: Mutex::new(Vec::new()),
            hooks: ArcSwap::from_pointee(Vec::new()),
            slots: ArcSwap::from_pointee(Slots::default()),
        }
    }

    /// Attach `dev` as an uplink and put it in promiscuous mode.
    pub fn attach(&self, dev: Arc<dyn NetDevice>) -> Result<()> {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        if dev.is_loopback() {
            return Err(MuxError::UplinkIsLoopback(dev.name().to_string()));
        }
        if attached.iter().any(|u| same_device(u, &dev)) {
            return Err(MuxError::UplinkBusy(dev.name().to_string()));
        }
        if attached.len() >= UPLINK_SLOTS {
            return Err(MuxError::UplinkTableFull);
        }
        dev.set_promiscuity(1)
            .map_err(|e| MuxError::UplinkSetup(dev.name().to_string(), e))?;

        info!(uplink = dev.name(), slot = attached.len(), "uplink attached");
        attached.push(dev);
        self.hooks.store(Arc::new(attached.clone()));
        self.rebuild(&attached);
        Ok(())
    }

    /// Detach `dev`: unhook it, release promiscuity, then rebuild the slots.
    pub fn detach(&self, dev: &Arc<dyn NetDevice>) -> Result<()> {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = attached.iter().position(|u| same_device(u, dev)) else {
            return Err(MuxError::UplinkNotAttached(dev.name().to_string()));
        };
        let dev = attached.remove(pos);
        self.hooks.store(Arc::new(attached.clone()));
        if let Err(e) = dev.set_promiscuity(-1) {
            warn!(uplink = dev.name(), error = %e, "failed to release promiscuity");
        }
        self.rebuild(&attached);
        info!(uplink = dev.name(), "uplink detached");
        Ok(())
    }

    /// Detach every uplink, in attach order.
    pub fn detach_all(&self) -> Vec<Arc<dyn NetDevice>> {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        let all: Vec<_> = attached.drain(..).collect();
        self.hooks.store(Arc::new(Vec::new()));
        for dev in &all {
            if let Err(e) = dev.set_promiscuity(-1) {
                warn!(uplink = dev.name(), error = %e, "failed to release promiscuity");
            }
        }
        self.rebuild(&attached);
        all
    }

    /// Recompute the slot table: slot `i` takes uplink `i mod count`.
    fn rebuild(&self, uplinks: &[Arc<dyn NetDevice>]) {
        let mut slots = Slots::default();
        if !uplinks.is_empty() {
            for (i, slot) in slots.iter_mut().enumerate() {
                *slot = Some(Arc::clone(&uplinks[i % uplinks.len()]));
            }
        }
        self.slots.store(Arc::new(slots));
    }

    /// Uplink for an egress hash; `None` when nothing is attached.
    #[inline]
    pub fn select(&self, hash: usize) -> Option<Arc<dyn NetDevice>> {
        self.slots.load()[hash & (UPLINK_SLOTS - 1)].clone()
    }

    /// Lock-free check that frames from `dev` should be demultiplexed.
    #[inline]
    pub fn is_attached(&self, dev: &Arc<dyn NetDevice>) -> bool {
        self.hooks.load().iter().any(|u| same_device(u, dev))
    }

    pub fn uplinks(&self) -> Vec<Arc<dyn NetDevice>> {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.attached.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if every attached uplink has carrier (vacuously true with none).
    pub fn all_carrier_ok(&self) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .all(|u| u.carrier_ok())
    }
}

impl Default for UplinkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    struct Dev {
        name: &'static str,
        loopback: bool,
        promisc: AtomicI32,
        carrier: AtomicBool,
    }

    impl NetDevice for Dev {
        fn name(&self) -> &str {
            self.name
        }
        fn is_up(&self) -> bool {
            true
        }
        fn carrier_ok(&self) -> bool {
            self.carrier.load(Ordering::SeqCst)
        }
        fn set_carrier(&self, on: bool) {
            self.carrier.store(on, Ordering::SeqCst);
        }
        fn is_loopback(&self) -> bool {
            self.loopback
        }
        fn set_promiscuity(&self, inc: i32) -> io::Result<()> {
            self.promisc.fetch_add(inc, Ordering::SeqCst);
            Ok(())
        }
        fn transmit(&self, _frame: Frame) -> io::Result<()> {
            Ok(())
        }
        fn forward(&self, _frame: Frame) -> io::Result<()> {
            Ok(())
        }
    }

    fn dev(name: &'static str) -> Arc<Dev> {
        Arc::new(Dev {
            name,
            loopback: false,
            promisc: AtomicI32::new(0),
            carrier: AtomicBool::new(true),
        })
    }

    fn names(table: &UplinkTable) -> Vec<Option<String>> {
        (0..UPLINK_SLOTS)
            .map(|i| table.select(i).map(|d| d.name().to_string()))
            .collect()
    }

    #[test]
    fn test_empty_table_selects_nothing() {
        let table = UplinkTable::new();
        for hash in 0..16 {
            assert!(table.select(hash).is_none());
        }
    }

    #[test]
    fn test_round_robin_slots() {
        let table = UplinkTable::new();
        table.attach(dev("eth0")).unwrap();
        table.attach(dev("eth1")).unwrap();
        table.attach(dev("eth2")).unwrap();

        let expect = ["eth0", "eth1", "eth2", "eth0", "eth1", "eth2", "eth0", "eth1"];
        let got = names(&table);
        for (slot, name) in got.iter().zip(expect) {
            assert_eq!(slot.as_deref(), Some(name));
        }
        // Hash wraps around the table.
        assert_eq!(table.select(9).unwrap().name(), "eth1");
    }

    #[test]
    fn test_detach_rebuilds_and_releases() {
        let table = UplinkTable::new();
        let eth0 = dev("eth0");
        let eth1 = dev("eth1");
        table.attach(eth0.clone()).unwrap();
        table.attach(eth1.clone()).unwrap();
        assert_eq!(eth0.promisc.load(Ordering::SeqCst), 1);

        let eth0_dyn: Arc<dyn NetDevice> = eth0.clone();
        table.detach(&eth0_dyn).unwrap();
        assert_eq!(eth0.promisc.load(Ordering::SeqCst), 0);
        assert!(!table.is_attached(&eth0_dyn));
        assert!(names(&table).iter().all(|n| n.as_deref() == Some("eth1")));

        assert!(matches!(
            table.detach(&eth0_dyn),
            Err(MuxError::UplinkNotAttached(_))
        ));

        table.detach_all();
        assert!(table.is_empty());
        assert!(table.select(0).is_none());
        assert_eq!(eth1.promisc.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attach_rejections() {
        let table = UplinkTable::new();
        let lo = Arc::new(Dev {
            name: "lo",
            loopback: true,
            promisc: AtomicI32::new(0),
            carrier: AtomicBool::new(true),
        });
        assert!(matches!(
            table.attach(lo),
            Err(MuxError::UplinkIsLoopback(_))
        ));

        let eth0 = dev("eth0");
        table.attach(eth0.clone()).unwrap();
        assert!(matches!(table.attach(eth0), Err(MuxError::UplinkBusy(_))));

        for name in ["e1", "e2", "e3", "e4", "e5", "e6", "e7"] {
            table.attach(dev(name)).unwrap();
        }
        assert!(matches!(
            table.attach(dev("e8")),
            Err(MuxError::UplinkTableFull)
        ));
        assert_eq!(table.len(), UPLINK_SLOTS);
    }

    #[test]
    fn test_all_carrier_ok() {
        let table = UplinkTable::new();
        assert!(table.all_carrier_ok());
        let eth0 = dev("eth0");
        table.attach(eth0.clone()).unwrap();
        table.attach(dev("eth1")).unwrap();
        assert!(table.all_carrier_ok());
        eth0.set_carrier(false);
        assert!(!table.all_carrier_ok());
    }
}
