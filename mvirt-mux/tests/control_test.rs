//! Control channel tests: message dispatch, the transmit queue and the
//! service loop, over scripted connections and a real abstract socket.

use std::sync::Arc;

use mvirt_mux::control::msg::{HEADER_LEN, RX_BUF_SIZE};
use mvirt_mux::control::{Ifinfo, Msg, SendStatus, SeqpacketConn};
use mvirt_mux::test_util::{
    DEFAULT_TIMEOUT, RecordingDevice, RecordingFactory, RecordingWatchers, ScriptedListener,
    ScriptedPeer, StaticNamespaces, wait_until,
};
use mvirt_mux::{
    LinkStat, Mux, MuxBuilder, MuxCounter, MuxError, MuxFlag, NetDevice, ProxyKind, Xid,
};

const NS_INUM: u64 = 4026531992;

struct Fixture {
    mux: Arc<Mux>,
    factory: Arc<RecordingFactory>,
    watchers: Arc<RecordingWatchers>,
}

fn fixture(name: &str) -> Fixture {
    let factory = RecordingFactory::new();
    let watchers = RecordingWatchers::new();
    let mux = MuxBuilder::new(RecordingDevice::new("xeth-mux"))
        .name(name)
        .factory(factory.clone())
        .watchers(watchers.clone())
        .namespaces(StaticNamespaces::new(&[NS_INUM]))
        .build()
        .unwrap();
    Fixture {
        mux,
        factory,
        watchers,
    }
}

/// Start the service on a scripted peer and wait until it is connected.
fn connect(fx: &Fixture, peer: &ScriptedPeer) {
    fx.mux
        .start_service_with(ScriptedListener::new(&[peer]))
        .unwrap();
    assert!(wait_until(DEFAULT_TIMEOUT, || fx
        .mux
        .flags()
        .test(MuxFlag::SbConnection)));
}

fn decoded(peer: &ScriptedPeer) -> Vec<Msg> {
    peer.sent()
        .iter()
        .map(|b| Msg::decode(b).unwrap())
        .collect()
}

#[test]
fn test_messages_without_controller_are_freed() {
    let fx = fixture("mux-ctl-free");

    fx.mux.send_msg(&Msg::NetnsAdd { net: 1 }).unwrap();
    fx.mux.send_msg(&Msg::Break).unwrap();

    assert_eq!(fx.mux.pool().queued(), 0);
    assert_eq!(fx.mux.pool().free_count(), 1);
    assert_eq!(fx.mux.counters().get(MuxCounter::SbtxQueued), 0);
}

#[test]
fn test_dispatch_counts_invalid_messages() {
    let fx = fixture("mux-ctl-inval");

    fx.mux.dispatch(&[1, 2, 3]);
    let mut bad_version = Msg::Break.encode();
    bad_version[HEADER_LEN - 2] = 0xff;
    fx.mux.dispatch(&bad_version);
    let mut nonzero = Msg::Break.encode();
    nonzero[0] = 1;
    fx.mux.dispatch(&nonzero);

    assert_eq!(fx.mux.counters().get(MuxCounter::SbrxInvalid), 3);

    // Well-formed header, unknown proxy kind in the body.
    let add = Msg::ProxyAdd {
        ifname: "xeth9".into(),
        xid: Xid::new(9),
        kind: 0,
        link: None,
    };
    fx.mux.dispatch(&add.encode());
    assert!(fx.mux.registry().lookup_by_id(Xid::new(9)).is_none());
    assert!(fx.factory.device("xeth9").is_none());
}

#[test]
fn test_carrier_and_link_stat_messages() {
    let fx = fixture("mux-ctl-carrier");
    fx.mux
        .create_proxy("xeth1", Xid::new(1), ProxyKind::Port, None)
        .unwrap();
    let vxid = Xid::from_vids(1, Some(10));
    fx.mux
        .create_proxy("xeth1.10", vxid, ProxyKind::Vlan, Some(Xid::new(1)))
        .unwrap();
    let port = fx.factory.device("xeth1").unwrap();
    let vlan = fx.factory.device("xeth1.10").unwrap();

    fx.mux.dispatch(
        &Msg::Carrier {
            xid: Xid::new(1),
            on: false,
        }
        .encode(),
    );
    assert!(!port.carrier_ok());
    assert!(!vlan.carrier_ok());

    fx.mux.dispatch(
        &Msg::LinkStat {
            xid: Xid::new(1),
            stat: LinkStat::RxCrcErrors,
            count: 42,
        }
        .encode(),
    );
    let proxy = fx.mux.registry().lookup_by_id(Xid::new(1)).unwrap();
    assert_eq!(proxy.stats().get(LinkStat::RxCrcErrors), 42);
}

#[test]
fn test_proxy_add_and_del_over_service() {
    let fx = fixture("mux-ctl-proxy");
    let peer = ScriptedPeer::new();
    connect(&fx, &peer);

    peer.push_inbound(
        Msg::ProxyAdd {
            ifname: "xeth5".into(),
            xid: Xid::new(5),
            kind: ProxyKind::Port.into(),
            link: None,
        }
        .encode(),
    );
    assert!(wait_until(DEFAULT_TIMEOUT, || fx
        .mux
        .registry()
        .lookup_by_id(Xid::new(5))
        .is_some()));

    // The new proxy is announced.
    assert!(wait_until(DEFAULT_TIMEOUT, || !peer.sent().is_empty()));
    match &decoded(&peer)[0] {
        Msg::Ifinfo(Ifinfo {
            ifname, xid, kind, ..
        }) => {
            assert_eq!(ifname, "xeth5");
            assert_eq!(*xid, Xid::new(5));
            assert_eq!(*kind, ProxyKind::Port);
        }
        other => panic!("unexpected message {other:?}"),
    }

    // A duplicate is rejected without disturbing the first.
    peer.push_inbound(
        Msg::ProxyAdd {
            ifname: "xeth5b".into(),
            xid: Xid::new(5),
            kind: ProxyKind::Port.into(),
            link: None,
        }
        .encode(),
    );
    peer.push_inbound(Msg::ProxyDel { xid: Xid::new(5) }.encode());
    assert!(wait_until(DEFAULT_TIMEOUT, || fx
        .mux
        .registry()
        .is_empty()));
    assert!(fx.factory.device("xeth5b").is_none());
    assert_eq!(fx.factory.released(), vec!["xeth5".to_string()]);

    fx.mux.stop_service();
}

#[test]
fn test_backpressure_preserves_order() {
    let fx = fixture("mux-ctl-order");
    let peer = ScriptedPeer::new();
    peer.script_sends(&[SendStatus::WouldBlock, SendStatus::WouldBlock]);
    connect(&fx, &peer);

    fx.mux.send_msg(&Msg::NetnsDel { net: 1 }).unwrap();
    fx.mux.send_msg(&Msg::NetnsDel { net: 2 }).unwrap();
    fx.mux.send_msg(&Msg::NetnsDel { net: 3 }).unwrap();

    assert!(wait_until(DEFAULT_TIMEOUT, || peer.sent().len() == 3));
    assert_eq!(
        decoded(&peer),
        vec![
            Msg::NetnsDel { net: 1 },
            Msg::NetnsDel { net: 2 },
            Msg::NetnsDel { net: 3 },
        ]
    );
    assert_eq!(peer.attempts(), 5);
    assert_eq!(fx.mux.counters().get(MuxCounter::SbtxRetries), 2);
    assert_eq!(fx.mux.counters().get(MuxCounter::SbtxMsgs), 3);
    assert_eq!(fx.mux.pool().queued(), 0);

    fx.mux.stop_service();
}

#[test]
fn test_reset_drops_connection_and_queue() {
    let fx = fixture("mux-ctl-reset");
    let peer = ScriptedPeer::new();
    peer.script_sends(&[SendStatus::Reset]);
    connect(&fx, &peer);

    fx.mux.send_msg(&Msg::NetnsDel { net: 1 }).unwrap();

    assert!(wait_until(DEFAULT_TIMEOUT, || !fx
        .mux
        .flags()
        .test(MuxFlag::SbConnection)));
    assert!(peer.sent().is_empty());
    assert_eq!(fx.mux.pool().queued(), 0);
    // Still listening for the next controller.
    assert!(fx.mux.flags().test(MuxFlag::SbListen));

    fx.mux.stop_service();
    assert!(!fx.mux.service_running());
}

#[test]
fn test_netns_add_starts_fib_watcher() {
    let fx = fixture("mux-ctl-netns");
    let peer = ScriptedPeer::new();
    connect(&fx, &peer);

    fx.mux.announce_netns(NS_INUM).unwrap();
    fx.mux.announce_netns(17).unwrap();
    assert!(wait_until(DEFAULT_TIMEOUT, || peer.sent().len() == 2));
    assert_eq!(fx.watchers.events(), vec![format!("start_fib:{NS_INUM}")]);

    // Disconnect stops every watcher, in order.
    peer.close();
    assert!(wait_until(DEFAULT_TIMEOUT, || !fx
        .mux
        .flags()
        .test(MuxFlag::SbConnection)));
    assert_eq!(
        fx.watchers.events()[1..],
        [
            "stop_netevent",
            "stop_all_fib",
            "stop_inetaddr",
            "stop_netdevice"
        ]
    );

    fx.mux.stop_service();
}

#[test]
fn test_connect_resets_stats_and_drops_port_carrier() {
    let fx = fixture("mux-ctl-stats");
    fx.mux
        .create_proxy("xeth1", Xid::new(1), ProxyKind::Port, None)
        .unwrap();
    let proxy = fx.mux.registry().lookup_by_id(Xid::new(1)).unwrap();
    proxy.stats().add(LinkStat::RxPackets, 10);
    fx.mux.stats().add(LinkStat::TxPackets, 10);

    let peer = ScriptedPeer::new();
    connect(&fx, &peer);

    assert_eq!(proxy.stats().get(LinkStat::RxPackets), 0);
    assert_eq!(fx.mux.stats().get(LinkStat::TxPackets), 0);
    let port = fx.factory.device("xeth1").unwrap();
    assert!(!port.carrier_ok());

    fx.mux.stop_service();
}

#[test]
fn test_service_already_running() {
    let fx = fixture("mux-ctl-twice");
    fx.mux
        .start_service_with(ScriptedListener::new(&[]))
        .unwrap();
    assert!(wait_until(DEFAULT_TIMEOUT, || fx.mux.service_running()));

    let again = fx.mux.start_service_with(ScriptedListener::new(&[]));
    assert!(matches!(again, Err(MuxError::AlreadyRunning)));

    fx.mux.stop_service();
    assert!(!fx.mux.service_running());

    // Restartable after a stop.
    fx.mux
        .start_service_with(ScriptedListener::new(&[]))
        .unwrap();
    fx.mux.teardown();
    assert!(!fx.mux.service_running());
}

#[test]
fn test_dump_over_abstract_socket() {
    let name = format!("mux-ctl-{}", std::process::id());
    let fx = fixture(&name);
    fx.mux
        .create_proxy("br0", Xid::new(3000), ProxyKind::Bridge, None)
        .unwrap();
    fx.mux
        .create_proxy("xeth1", Xid::new(1), ProxyKind::Port, None)
        .unwrap();
    fx.mux
        .create_proxy(
            "xeth1.10",
            Xid::from_vids(1, Some(10)),
            ProxyKind::Vlan,
            Some(Xid::new(1)),
        )
        .unwrap();

    fx.mux.start_service().unwrap();
    let mut conn = None;
    assert!(wait_until(DEFAULT_TIMEOUT, || {
        conn = SeqpacketConn::connect(&name).ok();
        conn.is_some()
    }));
    let conn = conn.unwrap();
    assert!(wait_until(DEFAULT_TIMEOUT, || fx
        .mux
        .flags()
        .test(MuxFlag::SbConnection)));

    conn.send_msg(&Msg::DumpIfinfo.encode()).unwrap();

    let mut buf = vec![0u8; RX_BUF_SIZE];
    let mut got = Vec::new();
    loop {
        let n = conn.recv_msg(&mut buf).unwrap();
        let msg = Msg::decode(&buf[..n]).unwrap();
        if msg == Msg::Break {
            break;
        }
        got.push(msg);
    }

    let names: Vec<_> = got
        .iter()
        .map(|m| match m {
            Msg::Ifinfo(info) => info.ifname.as_str(),
            other => panic!("unexpected message {other:?}"),
        })
        .collect();
    assert_eq!(names, ["xeth1", "xeth1.10", "br0"]);
    match &got[1] {
        Msg::Ifinfo(info) => assert_eq!(info.link, Some(Xid::new(1))),
        other => panic!("unexpected message {other:?}"),
    }

    drop(conn);
    assert!(wait_until(DEFAULT_TIMEOUT, || !fx
        .mux
        .flags()
        .test(MuxFlag::SbConnection)));
    fx.mux.teardown();
    assert!(fx.mux.registry().is_empty());
}
