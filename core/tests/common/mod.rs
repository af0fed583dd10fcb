//! Shared harness for service-level tests: a scripted overlay engine, an
//! always-up IP stack, a recording port mapper, and event helpers.

#![allow(dead_code)]

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::{
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tap_control::{MacAddr, MemTapFactory, MulticastGroup};
use tapmesh_core::engine::{
    ConfigOp, EngineEvent, EngineFactory, EngineFault, EngineHost, IpStack, MultipathMode,
    NetworkStatus, OverlayEngine, PeerView, PortMapper, SocketId, VirtualNetworkConfig,
};
use tapmesh_core::{Event, Node, ServiceConfig};
use tapmesh_shared::{NetworkId, PeerAddr};

pub const NWID: NetworkId = NetworkId(0x8056c2e21c000001);
pub const NODE_ADDR: PeerAddr = PeerAddr(0x89e92ceee5);

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// A scripted engine: it records everything the service drives into it and
/// lets tests invoke the host callbacks as the real engine would.
pub struct StubEngine {
    host: Arc<dyn EngineHost>,
    addr: PeerAddr,
    pub peers: Mutex<Vec<PeerView>>,
    pub wire_packets: Mutex<Vec<(SocketId, SocketAddr, Vec<u8>)>>,
    pub frames: Mutex<Vec<(NetworkId, u16, Vec<u8>)>>,
    pub joined: Mutex<Vec<NetworkId>>,
    pub left: Mutex<Vec<NetworkId>>,
    pub subscriptions: Mutex<Vec<(NetworkId, MulticastGroup)>>,
    pub unsubscriptions: Mutex<Vec<(NetworkId, MulticastGroup)>>,
    pub interface_addresses: Mutex<Vec<SocketAddr>>,
    pub multipath_pushes: Mutex<Vec<MultipathMode>>,
    pub background_runs: AtomicU64,
    prng: AtomicU64,
}

impl StubEngine {
    pub fn new(host: Arc<dyn EngineHost>, addr: PeerAddr) -> Arc<Self> {
        use tapmesh_core::engine::StateObject;

        if host.state_get(StateObject::IdentitySecret).is_none() {
            host.state_put(StateObject::IdentitySecret, Some(b"stub-secret-identity"));
            host.state_put(StateObject::IdentityPublic, Some(b"stub-public-identity"));
        }
        let engine = Arc::new(Self {
            host: host.clone(),
            addr,
            peers: Mutex::new(Vec::new()),
            wire_packets: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            interface_addresses: Mutex::new(Vec::new()),
            multipath_pushes: Mutex::new(Vec::new()),
            background_runs: AtomicU64::new(0),
            prng: AtomicU64::new(0x2545f4914f6cdd1d),
        });
        host.event(EngineEvent::Up);
        host.event(EngineEvent::Online);
        engine
    }

    pub fn host(&self) -> &Arc<dyn EngineHost> {
        &self.host
    }

    /// Invokes the network-config callback exactly as the engine would.
    pub fn deliver(&self, op: ConfigOp, config: VirtualNetworkConfig) -> i32 {
        self.host.network_config(op, config)
    }

    pub fn raise(&self, event: EngineEvent) {
        self.host.event(event);
    }

    pub fn set_peers(&self, peers: Vec<PeerView>) {
        *self.peers.lock() = peers;
    }

    pub fn seed_prng(&self, seed: u64) {
        self.prng.store(seed, Ordering::Relaxed);
    }
}

impl OverlayEngine for StubEngine {
    fn process_wire_packet(
        &self,
        local: SocketId,
        from: SocketAddr,
        data: &[u8],
        now: i64,
    ) -> Result<i64, EngineFault> {
        self.wire_packets.lock().push((local, from, data.to_vec()));
        Ok(now + 250)
    }

    fn process_virtual_frame(
        &self,
        nwid: NetworkId,
        _src: MacAddr,
        _dst: MacAddr,
        ethertype: u16,
        data: &[u8],
        now: i64,
    ) -> Result<i64, EngineFault> {
        self.frames.lock().push((nwid, ethertype, data.to_vec()));
        Ok(now + 250)
    }

    fn process_background_tasks(&self, now: i64) -> Result<i64, EngineFault> {
        self.background_runs.fetch_add(1, Ordering::Relaxed);
        Ok(now + 100)
    }

    fn join(&self, nwid: NetworkId) -> Result<(), EngineFault> {
        self.joined.lock().push(nwid);
        Ok(())
    }

    fn leave(&self, nwid: NetworkId) -> Result<(), EngineFault> {
        self.left.lock().push(nwid);
        Ok(())
    }

    fn multicast_subscribe(&self, nwid: NetworkId, group: MulticastGroup) {
        self.subscriptions.lock().push((nwid, group));
    }

    fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup) {
        self.unsubscriptions.lock().push((nwid, group));
    }

    fn peers(&self) -> Vec<PeerView> {
        self.peers.lock().clone()
    }

    fn set_interface_addresses(&self, addrs: &[SocketAddr]) {
        *self.interface_addresses.lock() = addrs.to_vec();
    }

    fn set_multipath_mode(&self, mode: MultipathMode) {
        self.multipath_pushes.lock().push(mode);
    }

    fn address(&self) -> PeerAddr {
        self.addr
    }

    fn prng_u64(&self) -> u64 {
        // Deterministic LCG so hint selection is reproducible under
        // seed_prng.
        self.prng
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
            })
            .unwrap()
    }
}

pub struct StubStack {
    pub up: AtomicBool,
}

impl IpStack for StubStack {
    fn netif_up(&self, _nwid: NetworkId) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct StubMapper {
    pub local_ports: Mutex<Vec<u16>>,
    pub externals: Mutex<Vec<SocketAddr>>,
}

impl PortMapper for StubMapper {
    fn set_local_port(&self, port: u16) {
        self.local_ports.lock().push(port);
    }

    fn external_addresses(&self) -> Vec<SocketAddr> {
        self.externals.lock().clone()
    }
}

/// Produces an engine factory plus a slot the test can pull the engine out
/// of once the node is up.
pub fn stub_engine_factory(
    addr: PeerAddr,
) -> (EngineFactory, Arc<Mutex<Option<Arc<StubEngine>>>>) {
    let slot = Arc::new(Mutex::new(None));
    let slot_for_factory = slot.clone();
    let factory: EngineFactory = Box::new(move |host| {
        let engine = StubEngine::new(host, addr);
        *slot_for_factory.lock() = Some(engine.clone());
        Ok(engine as Arc<dyn OverlayEngine>)
    });
    (factory, slot)
}

pub struct TestNode {
    pub node: Node,
    pub events: Receiver<Event>,
    pub engine: Arc<StubEngine>,
    pub taps: Arc<MemTapFactory>,
    pub stack: Arc<StubStack>,
    pub mapper: Arc<StubMapper>,
    pub home: tempfile::TempDir,
}

pub fn start_node(config: ServiceConfig) -> TestNode {
    let home = tempfile::tempdir().unwrap();
    start_node_in(home, config)
}

pub fn start_node_in(home: tempfile::TempDir, config: ServiceConfig) -> TestNode {
    let (events_tx, events) = crossbeam_channel::unbounded();
    let (factory, slot) = stub_engine_factory(NODE_ADDR);
    let taps = Arc::new(MemTapFactory::new());
    let stack = Arc::new(StubStack {
        up: AtomicBool::new(true),
    });
    let mapper = Arc::new(StubMapper::default());

    let node = Node::start(
        home.path(),
        config,
        events_tx,
        factory,
        taps.clone(),
        stack.clone(),
        Some(mapper.clone() as Arc<dyn PortMapper>),
    )
    .expect("node should start");

    let engine = slot.lock().clone().expect("engine factory should have run");
    TestNode {
        node,
        events,
        engine,
        taps,
        stack,
        mapper,
        home,
    }
}

/// A config that binds only loopback on a known free port, keeping tests
/// off the machine's real interfaces.
pub fn loopback_config() -> (ServiceConfig, u16) {
    let port = free_udp_port();
    let config = ServiceConfig {
        bind: vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)],
        ..Default::default()
    };
    (config, port)
}

pub fn free_udp_port() -> u16 {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn next_event(events: &Receiver<Event>) -> Event {
    events
        .recv_timeout(EVENT_TIMEOUT)
        .expect("timed out waiting for an event")
}

/// Asserts that the next events match `codes` exactly, in order.
pub fn expect_events(events: &Receiver<Event>, codes: &[&str]) -> Vec<Event> {
    let mut seen = Vec::new();
    for expected in codes {
        let event = next_event(events);
        assert_eq!(
            event.code(),
            *expected,
            "expected {expected}, got {event} (after {seen:?})"
        );
        seen.push(event);
    }
    seen
}

/// Waits until `predicate` holds or the timeout expires.
pub fn wait_for(mut predicate: impl FnMut() -> bool, what: &str) {
    let start = Instant::now();
    while start.elapsed() < EVENT_TIMEOUT {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

pub fn network_config(
    status: NetworkStatus,
    assigned: &[&str],
) -> VirtualNetworkConfig {
    VirtualNetworkConfig {
        nwid: NWID,
        name: "testnet".to_string(),
        mac: "02:bc:14:a9:00:01".parse().unwrap(),
        mtu: 2800,
        status,
        assigned_addresses: assigned.iter().map(|s| s.parse().unwrap()).collect(),
        routes: Vec::new(),
        multicast_subscriptions: Vec::new(),
    }
}
