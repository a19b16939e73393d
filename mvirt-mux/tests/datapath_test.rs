//! End-to-end frame path tests.
//!
//! A mux is built over in-memory devices; frames are injected on the
//! uplinks and from proxies, and the devices record where they end up.

use std::sync::Arc;

use mvirt_mux::frame::{ETH_P_8021AD, ETH_P_8021Q, VID_EXCEPTION_HIGH, VLAN_PRIO_SHIFT};
use mvirt_mux::test_util::{
    RecordingDevice, RecordingFactory, double_tagged_frame, eth_frame, tagged_frame,
};
use mvirt_mux::{
    Encap, LinkStat, Mux, MuxBuilder, MuxCounter, MuxError, NetDevice, ProxyKind, VlanTag, Xid,
};

struct Fixture {
    mux: Arc<Mux>,
    dev: Arc<RecordingDevice>,
    uplinks: Vec<Arc<RecordingDevice>>,
    factory: Arc<RecordingFactory>,
}

impl Fixture {
    fn new(uplinks: usize) -> Self {
        Self::with_encap(uplinks, Encap::Vlan)
    }

    fn with_encap(uplinks: usize, encap: Encap) -> Self {
        let dev = RecordingDevice::new("xeth-mux");
        let factory = RecordingFactory::new();
        let mux = MuxBuilder::new(dev.clone())
            .encap(encap)
            .factory(factory.clone())
            .build()
            .unwrap();
        let uplinks: Vec<_> = (0..uplinks)
            .map(|i| RecordingDevice::new(&format!("eth{i}")))
            .collect();
        for uplink in &uplinks {
            mux.attach_uplink(uplink.clone()).unwrap();
        }
        Fixture {
            mux,
            dev,
            uplinks,
            factory,
        }
    }

    fn port(&self, ifname: &str, vid: u16) -> Arc<RecordingDevice> {
        self.mux
            .create_proxy(ifname, Xid::from_vids(vid, None), ProxyKind::Port, None)
            .unwrap();
        self.factory.device(ifname).unwrap()
    }

    fn uplink(&self, i: usize) -> Arc<dyn NetDevice> {
        self.uplinks[i].clone()
    }

    fn mux_stat(&self, s: LinkStat) -> u64 {
        self.mux.stats().get(s)
    }

    fn proxy_stat(&self, vid: u16, s: LinkStat) -> u64 {
        self.mux
            .registry()
            .lookup_by_id(Xid::from_vids(vid, None))
            .unwrap()
            .stats()
            .get(s)
    }
}

#[test]
fn test_demux_delivers_to_port() {
    let fx = Fixture::new(2);
    let port = fx.port("xeth1", 100);

    let frame = tagged_frame(100);
    fx.mux.receive_from_uplink(&fx.uplink(0), frame);

    let got = port.forwarded();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], eth_frame());
    assert_eq!(fx.proxy_stat(100, LinkStat::RxPackets), 1);
    assert_eq!(fx.proxy_stat(100, LinkStat::RxBytes), eth_frame().len() as u64);
    assert_eq!(fx.mux_stat(LinkStat::RxPackets), 1);
    assert_eq!(fx.mux.stats().error_total(), 0);
    assert!(fx.dev.forwarded().is_empty());
}

#[test]
fn test_demux_recovers_priority() {
    let fx = Fixture::new(1);
    let port = fx.port("xeth1", 100);

    let frame = eth_frame()
        .push_tag(VlanTag {
            tpid: ETH_P_8021Q,
            tci: (5 << VLAN_PRIO_SHIFT) | 100,
        })
        .unwrap();
    fx.mux.receive_from_uplink(&fx.uplink(0), frame);

    let got = port.forwarded();
    assert_eq!(got[0].meta().priority, 5);
    assert_eq!(got[0].meta().vlan, None);
}

#[test]
fn test_exception_vid_goes_to_mux_device() {
    let fx = Fixture::new(2);
    let port = fx.port("xeth1", 100);

    let frame = tagged_frame(VID_EXCEPTION_HIGH);
    let len = frame.len() as u64;
    fx.mux.receive_from_uplink(&fx.uplink(1), frame);

    let got = fx.dev.forwarded();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].bytes(), eth_frame().bytes());
    assert_eq!(got[0].meta().vlan.map(|t| t.vid()), Some(VID_EXCEPTION_HIGH));
    assert_eq!(fx.mux.counters().get(MuxCounter::ExFrames), 1);
    assert_eq!(fx.mux.counters().get(MuxCounter::ExBytes), len);
    assert!(port.forwarded().is_empty());

    // VID 0 is reserved as well.
    fx.mux.receive_from_uplink(&fx.uplink(0), tagged_frame(0));
    assert_eq!(fx.mux.counters().get(MuxCounter::ExFrames), 2);
    assert_eq!(fx.dev.forwarded().len(), 2);
}

#[test]
fn test_exception_clears_priority_bits() {
    let fx = Fixture::new(1);
    let frame = eth_frame()
        .push_tag(VlanTag {
            tpid: ETH_P_8021Q,
            tci: (6 << VLAN_PRIO_SHIFT) | VID_EXCEPTION_HIGH,
        })
        .unwrap();
    fx.mux.demux(frame);

    let got = fx.dev.forwarded();
    assert_eq!(got[0].meta().priority, 6);
    assert_eq!(got[0].meta().vlan.unwrap().tci, VID_EXCEPTION_HIGH);
}

#[test]
fn test_demux_drops() {
    let fx = Fixture::new(1);
    let port = fx.port("xeth1", 100);

    // Untagged.
    fx.mux.demux(eth_frame());
    assert_eq!(fx.mux_stat(LinkStat::RxErrors), 1);
    assert_eq!(fx.mux_stat(LinkStat::RxFrameErrors), 1);

    // No proxy for the identifier.
    fx.mux.demux(tagged_frame(200));
    assert_eq!(fx.mux_stat(LinkStat::RxErrors), 2);
    assert_eq!(fx.mux_stat(LinkStat::RxNohandler), 1);

    // Proxy device down.
    port.set_up(false);
    fx.mux.demux(tagged_frame(100));
    assert_eq!(fx.mux_stat(LinkStat::RxDropped), 1);

    // Proxy refuses the frame.
    port.set_up(true);
    port.set_fail(true);
    fx.mux.demux(tagged_frame(100));
    assert_eq!(fx.mux_stat(LinkStat::RxDropped), 2);
    assert_eq!(fx.proxy_stat(100, LinkStat::RxDropped), 2);

    assert!(port.forwarded().is_empty());
    assert_eq!(fx.mux_stat(LinkStat::RxPackets), 0);
}

#[test]
fn test_frames_from_unhooked_device_are_ignored() {
    let fx = Fixture::new(2);
    let port = fx.port("xeth1", 100);

    let stray: Arc<dyn NetDevice> = RecordingDevice::new("eth9");
    fx.mux.receive_from_uplink(&stray, tagged_frame(100));

    let eth0 = fx.uplink(0);
    fx.mux.detach_uplink(&eth0).unwrap();
    fx.mux.receive_from_uplink(&eth0, tagged_frame(100));
    assert!(port.forwarded().is_empty());

    fx.mux.receive_from_uplink(&fx.uplink(1), tagged_frame(100));
    assert_eq!(port.forwarded().len(), 1);
}

#[test]
fn test_port_encap_selects_uplink_by_vid() {
    let fx = Fixture::new(2);
    fx.port("xeth1", 100);
    fx.port("xeth2", 101);

    fx.mux.proxy_xmit(Xid::new(100), eth_frame());
    fx.mux.proxy_xmit(Xid::new(101), eth_frame());

    let even = fx.uplinks[0].transmitted();
    let odd = fx.uplinks[1].transmitted();
    assert_eq!(even.len(), 1);
    assert_eq!(odd.len(), 1);
    assert_eq!(even[0].outer_tag(), Some(VlanTag::new(ETH_P_8021Q, 100)));
    assert_eq!(odd[0].outer_tag(), Some(VlanTag::new(ETH_P_8021Q, 101)));

    let tagged_len = eth_frame().len() as u64 + 4;
    assert_eq!(fx.proxy_stat(100, LinkStat::TxPackets), 1);
    assert_eq!(fx.proxy_stat(100, LinkStat::TxBytes), tagged_len);
    assert_eq!(fx.mux_stat(LinkStat::TxPackets), 2);
    assert_eq!(fx.mux_stat(LinkStat::TxBytes), 2 * tagged_len);
}

#[test]
fn test_vlan_identifier_round_trip_edge_vids() {
    let fx = Fixture::new(2);
    for low in [1u16, 0xffe] {
        fx.port(&format!("xeth{low}"), low);
        for high in [1u16, 0xffe, 0xfff] {
            let xid = Xid::from_vids(low, Some(high));
            let ifname = format!("xeth{low}.{high}");
            fx.mux
                .create_proxy(&ifname, xid, ProxyKind::Vlan, Some(Xid::from_vids(low, None)))
                .unwrap();
            let vlan = fx.factory.device(&ifname).unwrap();

            let uplink = &fx.uplinks[usize::from(low & 1)];
            fx.mux.proxy_xmit(xid, eth_frame());
            let wire = uplink.transmitted().pop().unwrap();
            let (outer, inner_frame) = wire.clone().pop_tag().unwrap();
            assert_eq!(outer, VlanTag::new(ETH_P_8021AD, low), "{ifname}");
            assert_eq!(
                inner_frame.outer_tag(),
                Some(VlanTag::new(ETH_P_8021Q, high)),
                "{ifname}"
            );

            fx.mux.receive_from_uplink(&fx.uplink(usize::from(low & 1)), wire);
            assert_eq!(vlan.forwarded(), vec![eth_frame()], "{ifname}");
        }
    }
    assert_eq!(fx.mux_stat(LinkStat::RxNohandler), 0);
    assert_eq!(fx.mux_stat(LinkStat::RxErrors), 0);
}

#[test]
fn test_create_proxy_rejects_unroutable_identifiers() {
    let fx = Fixture::new(2);
    fx.port("xeth100", 100);

    let rejected = [
        (Xid::new((1 << 12) | 100), ProxyKind::Port),
        (Xid::new(0x1000), ProxyKind::Bridge),
        (Xid::new(0x0fff), ProxyKind::Port),
        (Xid::new(0), ProxyKind::Lag),
        (Xid::new(0x0fff), ProxyKind::LoadBalancer),
        (Xid::from_vids(0, Some(5)), ProxyKind::Vlan),
        (Xid::from_vids(0xfff, Some(5)), ProxyKind::Vlan),
        (Xid::new(0x0100_0064), ProxyKind::Vlan),
    ];
    for (i, (xid, kind)) in rejected.into_iter().enumerate() {
        let ifname = format!("bad{i}");
        let err = fx.mux.create_proxy(&ifname, xid, kind, None).unwrap_err();
        assert!(
            matches!(err, MuxError::InvalidXid { xid: x, .. } if x == xid),
            "{xid} as {kind:?}: {err}"
        );
        assert!(fx.factory.device(&ifname).is_none());
        assert!(fx.mux.registry().lookup_by_id(xid).is_none());
    }
    assert_eq!(fx.mux.registry().len(), 1);

    // The edges of the valid range are accepted.
    fx.port("xeth1", 1);
    fx.port("xeth4094", 0xffe);
    let top = Xid::from_vids(1, Some(0xfff));
    fx.mux
        .create_proxy("xeth1.4095", top, ProxyKind::Vlan, Some(Xid::new(1)))
        .unwrap();
    assert_eq!(fx.mux.registry().len(), 4);
}

#[test]
fn test_rejected_port_never_claims_low_vid_traffic() {
    let fx = Fixture::new(2);
    let port = fx.port("xeth100", 100);
    assert!(
        fx.mux
            .create_proxy("xeth4196", Xid::new((1 << 12) | 100), ProxyKind::Port, None)
            .is_err()
    );

    fx.mux.receive_from_uplink(&fx.uplink(0), tagged_frame(100));
    assert_eq!(port.forwarded().len(), 1);
    assert_eq!(fx.mux_stat(LinkStat::RxNohandler), 0);
}

#[test]
fn test_vlan_identifier_round_trip() {
    let fx = Fixture::new(2);
    fx.port("xeth7", 7);
    let xid = Xid::from_vids(7, Some(300));
    fx.mux
        .create_proxy("xeth7.300", xid, ProxyKind::Vlan, Some(Xid::new(7)))
        .unwrap();
    let vlan = fx.factory.device("xeth7.300").unwrap();

    fx.mux.proxy_xmit(xid, eth_frame());

    // Low VID 7 is odd: second uplink.
    let sent = fx.uplinks[1].transmitted();
    assert_eq!(sent.len(), 1);
    let wire = sent[0].clone();
    let (outer, inner_frame) = wire.clone().pop_tag().unwrap();
    assert_eq!(outer, VlanTag::new(ETH_P_8021AD, 7));
    assert_eq!(inner_frame.outer_tag(), Some(VlanTag::new(ETH_P_8021Q, 300)));

    // The same frame coming back resolves to the same proxy.
    fx.mux.receive_from_uplink(&fx.uplink(1), wire);
    let got = vlan.forwarded();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], eth_frame());

    // A double-tagged frame for an unknown inner VID is not delivered.
    fx.mux.demux(double_tagged_frame(7, 301));
    assert_eq!(vlan.forwarded().len(), 1);
    assert_eq!(fx.mux_stat(LinkStat::RxNohandler), 1);
}

#[test]
fn test_no_uplink_loops_back_to_mux_device() {
    let fx = Fixture::new(0);
    fx.port("xeth1", 100);

    fx.mux.proxy_xmit(Xid::new(100), eth_frame());

    let got = fx.dev.forwarded();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].outer_tag(), Some(VlanTag::new(ETH_P_8021Q, 100)));
    assert_eq!(fx.mux_stat(LinkStat::RxPackets), 1);

    fx.dev.set_fail(true);
    fx.mux.proxy_xmit(Xid::new(100), eth_frame());
    assert_eq!(fx.mux_stat(LinkStat::TxErrors), 1);
    assert_eq!(fx.mux_stat(LinkStat::TxAbortedErrors), 1);
}

#[test]
fn test_uplink_down_counts_heartbeat_error() {
    let fx = Fixture::new(2);
    fx.port("xeth1", 100);
    fx.uplinks[0].set_up(false);

    fx.mux.proxy_xmit(Xid::new(100), eth_frame());

    assert!(fx.uplinks[0].transmitted().is_empty());
    assert!(fx.uplinks[1].transmitted().is_empty());
    assert_eq!(fx.mux_stat(LinkStat::TxErrors), 1);
    assert_eq!(fx.mux_stat(LinkStat::TxHeartbeatErrors), 1);

    fx.uplinks[0].set_up(true);
    fx.uplinks[0].set_fail(true);
    fx.mux.proxy_xmit(Xid::new(100), eth_frame());
    assert_eq!(fx.mux_stat(LinkStat::TxDropped), 1);
}

#[test]
fn test_mux_device_down_counts_carrier_error() {
    let fx = Fixture::new(1);
    fx.port("xeth1", 100);
    fx.dev.set_up(false);

    fx.mux.proxy_xmit(Xid::new(100), eth_frame());

    assert!(fx.uplinks[0].transmitted().is_empty());
    assert_eq!(fx.mux_stat(LinkStat::TxErrors), 1);
    assert_eq!(fx.mux_stat(LinkStat::TxCarrierErrors), 1);
    assert_eq!(fx.proxy_stat(100, LinkStat::TxPackets), 0);
}

#[test]
fn test_runt_frame_fails_tag_insertion() {
    let fx = Fixture::new(1);
    fx.port("xeth1", 100);

    fx.mux
        .proxy_xmit(Xid::new(100), mvirt_mux::Frame::new(vec![0u8; 6]));

    assert_eq!(fx.proxy_stat(100, LinkStat::TxErrors), 1);
    assert_eq!(fx.proxy_stat(100, LinkStat::TxDropped), 1);
    assert!(fx.uplinks[0].transmitted().is_empty());
}

#[test]
fn test_vpls_drops_everything() {
    let fx = Fixture::with_encap(1, Encap::Vpls);
    fx.port("xeth1", 100);

    fx.mux.proxy_xmit(Xid::new(100), eth_frame());
    assert_eq!(fx.proxy_stat(100, LinkStat::TxDropped), 1);

    fx.mux.xmit(tagged_frame(100));
    assert_eq!(fx.mux_stat(LinkStat::TxDropped), 1);
    assert!(fx.uplinks[0].transmitted().is_empty());
}

#[test]
fn test_host_exception_frame_is_delivered_locally() {
    let fx = Fixture::new(1);

    fx.mux.xmit(tagged_frame(VID_EXCEPTION_HIGH));

    assert!(fx.uplinks[0].transmitted().is_empty());
    assert_eq!(fx.dev.forwarded().len(), 1);
    assert_eq!(fx.mux.counters().get(MuxCounter::ExFrames), 1);
}

#[test]
fn test_mux_carrier_follows_uplinks() {
    let fx = Fixture::new(2);
    assert!(fx.dev.carrier_ok());

    fx.uplinks[1].set_carrier(false);
    fx.mux.check_lower_carrier();
    assert!(!fx.dev.carrier_ok());

    fx.mux.detach_uplink(&fx.uplink(1)).unwrap();
    assert!(fx.dev.carrier_ok());
    assert_eq!(fx.uplinks[1].promiscuity(), 0);
    assert_eq!(fx.uplinks[0].promiscuity(), 1);
}

#[test]
fn test_concurrent_demux_and_delete() {
    let fx = Fixture::new(1);
    fx.port("xeth1", 100);

    let mux = Arc::clone(&fx.mux);
    let uplink = fx.uplink(0);
    let rx = std::thread::spawn(move || {
        for _ in 0..2000 {
            mux.receive_from_uplink(&uplink, tagged_frame(100));
        }
    });
    fx.mux.delete_proxy(Xid::new(100)).unwrap();
    rx.join().unwrap();

    let delivered = fx.mux_stat(LinkStat::RxPackets);
    let missed = fx.mux_stat(LinkStat::RxNohandler);
    assert_eq!(delivered + missed, 2000);
    assert_eq!(fx.factory.released(), vec!["xeth1".to_string()]);
}
