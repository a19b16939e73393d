//! Test utilities for mvirt-mux integration tests.
//!
//! Provides in-memory devices, a scripted control connection and frame
//! builders so the datapath and the control service can be driven without
//! TAP devices or a controller process.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smoltcp::wire::EthernetAddress;

use crate::control::socket::{RecvStatus, SbConn, SbListen, SendStatus};
use crate::control::watchers::{EventWatchers, Namespace, NamespaceDirectory};
use crate::device::{DeviceFactory, NetDevice};
use crate::frame::{ETH_P_8021AD, ETH_P_8021Q, Frame, VlanTag};
use crate::mux::Mux;
use crate::proxy::{ProxyKind, Xid};

/// Default timeout for waiting on the service thread in tests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

pub const TEST_DST: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const TEST_SRC: EthernetAddress = EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Untagged IPv4 frame with a small payload.
pub fn eth_frame() -> Frame {
    Frame::ethernet(TEST_DST, TEST_SRC, 0x0800, &[0x45, 0, 0, 20, 0, 0, 0, 0])
}

/// IPv4 frame with one 802.1Q tag.
pub fn tagged_frame(vid: u16) -> Frame {
    tag(eth_frame(), ETH_P_8021Q, vid)
}

/// IPv4 frame with an outer 802.1AD tag over an inner 802.1Q tag.
pub fn double_tagged_frame(outer_vid: u16, inner_vid: u16) -> Frame {
    tag(tag(eth_frame(), ETH_P_8021Q, inner_vid), ETH_P_8021AD, outer_vid)
}

fn tag(frame: Frame, tpid: u16, vid: u16) -> Frame {
    let len = frame.len();
    frame
        .push_tag(VlanTag::new(tpid, vid))
        .unwrap_or_else(|| panic!("frame of {len} bytes cannot take a tag"))
}

/// In-memory device recording every frame handed to it.
pub struct RecordingDevice {
    name: String,
    up: AtomicBool,
    carrier: AtomicBool,
    loopback: bool,
    fail: AtomicBool,
    promisc: AtomicI32,
    transmitted: Mutex<Vec<Frame>>,
    forwarded: Mutex<Vec<Frame>>,
}

impl RecordingDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self::with_loopback(name, false))
    }

    pub fn loopback(name: &str) -> Arc<Self> {
        Arc::new(Self::with_loopback(name, true))
    }

    fn with_loopback(name: &str, loopback: bool) -> Self {
        RecordingDevice {
            name: name.to_string(),
            up: AtomicBool::new(true),
            carrier: AtomicBool::new(true),
            loopback,
            fail: AtomicBool::new(false),
            promisc: AtomicI32::new(0),
            transmitted: Mutex::new(Vec::new()),
            forwarded: Mutex::new(Vec::new()),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Make `transmit` and `forward` fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn promiscuity(&self) -> i32 {
        self.promisc.load(Ordering::SeqCst)
    }

    pub fn transmitted(&self) -> Vec<Frame> {
        self.transmitted.lock().unwrap().clone()
    }

    pub fn forwarded(&self) -> Vec<Frame> {
        self.forwarded.lock().unwrap().clone()
    }

    fn record(&self, into: &Mutex<Vec<Frame>>, frame: Frame) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected failure"));
        }
        into.lock().unwrap().push(frame);
        Ok(())
    }
}

impl NetDevice for RecordingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
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

    fn transmit(&self, frame: Frame) -> io::Result<()> {
        self.record(&self.transmitted, frame)
    }

    fn forward(&self, frame: Frame) -> io::Result<()> {
        self.record(&self.forwarded, frame)
    }
}

/// Factory handing out `RecordingDevice`s and remembering them by name.
#[derive(Default)]
pub struct RecordingFactory {
    devices: Mutex<HashMap<String, Arc<RecordingDevice>>>,
    released: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn device(&self, name: &str) -> Option<Arc<RecordingDevice>> {
        self.devices.lock().unwrap().get(name).cloned()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DeviceFactory for RecordingFactory {
    fn create(
        &self,
        _mux: &Arc<Mux>,
        ifname: &str,
        _xid: Xid,
        _kind: ProxyKind,
    ) -> io::Result<Arc<dyn NetDevice>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected failure"));
        }
        let dev = RecordingDevice::new(ifname);
        self.devices
            .lock()
            .unwrap()
            .insert(ifname.to_string(), Arc::clone(&dev));
        Ok(dev)
    }

    fn release(&self, device: &Arc<dyn NetDevice>) {
        self.released.lock().unwrap().push(device.name().to_string());
    }
}

/// Watchers recording each call as a short event string.
#[derive(Default)]
pub struct RecordingWatchers {
    events: Mutex<Vec<String>>,
}

impl RecordingWatchers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl EventWatchers for RecordingWatchers {
    fn start_fib(&self, ns: &Namespace) {
        self.push(format!("start_fib:{}", ns.inum));
    }

    fn stop_netevent(&self) {
        self.push("stop_netevent".into());
    }

    fn stop_all_fib(&self) {
        self.push("stop_all_fib".into());
    }

    fn stop_inetaddr(&self) {
        self.push("stop_inetaddr".into());
    }

    fn stop_netdevice(&self) {
        self.push("stop_netdevice".into());
    }
}

/// Fixed set of namespaces.
#[derive(Default)]
pub struct StaticNamespaces {
    known: HashMap<u64, Namespace>,
}

impl StaticNamespaces {
    pub fn new(inums: &[u64]) -> Arc<Self> {
        let known = inums
            .iter()
            .map(|&inum| {
                let path = format!("/proc/{inum}/ns/net").into();
                (inum, Namespace { inum, path })
            })
            .collect();
        Arc::new(StaticNamespaces { known })
    }
}

impl NamespaceDirectory for StaticNamespaces {
    fn lookup(&self, inum: u64) -> Option<Namespace> {
        self.known.get(&inum).cloned()
    }
}

#[derive(Default)]
struct PeerState {
    inbound: VecDeque<Vec<u8>>,
    send_script: VecDeque<SendStatus>,
    sent: Vec<Vec<u8>>,
    attempts: usize,
    closed: bool,
}

/// Test side of a scripted control connection.
///
/// Messages pushed with `push_inbound` are received by the service; every
/// send consumes the next scripted status (`Sent` once the script runs out).
#[derive(Clone, Default)]
pub struct ScriptedPeer {
    state: Arc<Mutex<PeerState>>,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&self, msg: Vec<u8>) {
        self.state.lock().unwrap().inbound.push_back(msg);
    }

    pub fn script_sends(&self, statuses: &[SendStatus]) {
        self.state
            .lock()
            .unwrap()
            .send_script
            .extend(statuses.iter().copied());
    }

    /// Messages the service sent successfully, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Send attempts, including retried ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    /// Close the connection once the inbound queue is drained.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    pub fn conn(&self) -> ScriptedConn {
        ScriptedConn {
            state: Arc::clone(&self.state),
        }
    }
}

pub struct ScriptedConn {
    state: Arc<Mutex<PeerState>>,
}

impl SbConn for ScriptedConn {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<RecvStatus> {
        let mut state = self.state.lock().unwrap();
        match state.inbound.pop_front() {
            Some(msg) => {
                let n = msg.len().min(buf.len());
                buf[..n].copy_from_slice(&msg[..n]);
                Ok(RecvStatus::Data(n))
            }
            None if state.closed => Ok(RecvStatus::Closed),
            None => Ok(RecvStatus::Empty),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<SendStatus> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        let status = state
            .send_script
            .pop_front()
            .unwrap_or(SendStatus::Sent(buf.len()));
        if let SendStatus::Sent(_) = status {
            state.sent.push(buf.to_vec());
        }
        Ok(status)
    }
}

/// Listener accepting a fixed sequence of scripted connections.
pub struct ScriptedListener {
    pending: VecDeque<ScriptedConn>,
}

impl ScriptedListener {
    pub fn new(peers: &[&ScriptedPeer]) -> Box<Self> {
        Box::new(ScriptedListener {
            pending: peers.iter().map(|p| p.conn()).collect(),
        })
    }
}

impl SbListen for ScriptedListener {
    fn accept(&mut self) -> io::Result<Option<Box<dyn SbConn>>> {
        Ok(self
            .pending
            .pop_front()
            .map(|c| Box::new(c) as Box<dyn SbConn>))
    }
}
