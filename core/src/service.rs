//! The node service: initialization, the control loop, the engine-host
//! capability object, and termination handling.

use crate::binder::{should_bind_interface, Binder};
use crate::config::{LocalConfig, ServiceConfig};
use crate::engine::{
    AddressFamily, ConfigOp, EngineEvent, EngineFactory, EngineHost, IpStack, OverlayEngine,
    PortMapper, SocketId, StateObject, VirtualNetworkConfig,
};
use crate::events::{Event, EventSink};
use crate::nets::NetworkState;
use crate::packet::{InboundPacket, PacketPlane};
use crate::paths::LocalTables;
use crate::peers::PeerDeltaDetector;
use crate::ports::{self, Ports};
use crate::store::{self, StateStore};
use crate::{
    BINDER_REFRESH_PERIOD_MS, FIRST_INTERFACE_CHECK_DELAY_MS, LOCAL_INTERFACE_CHECK_INTERVAL_MS,
    MAX_LOOP_DELAY_MS, MIN_LOOP_DELAY_MS, MULTIPATH_MODE_UPDATE_PERIOD_MS, PEER_CACHE_CLEAN_INTERVAL_MS,
    PEER_CACHE_MAX_AGE, SLEEP_WAKE_GAP_MS, TAP_CHECK_MULTICAST_INTERVAL_MS,
};
use anyhow::bail;
use colored::*;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    ops::Deref,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tap_control::{MacAddr, TapFactory};
use tapmesh_shared::{scope_of, Error, IpScope, NetworkId, NetworkSettings, PeerAddr};

/// Why the service stopped (or that it hasn't).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    StillRunning,
    NormalTermination,
    UnrecoverableError,
    IdentityCollision,
}

#[derive(Debug, Clone)]
pub struct Termination {
    pub reason: TerminationReason,
    pub message: Option<String>,
}

/// Monotonic milliseconds since service start; the only clock the service
/// uses for scheduling.
#[derive(Clone, Copy)]
pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }
}

pub(crate) enum ControlMsg {
    Wake,
    Join(NetworkId),
    Leave(NetworkId),
    SetNetworkSettings(NetworkId, NetworkSettings),
}

pub(crate) struct ServiceInner {
    pub cfg: ServiceConfig,
    pub home: PathBuf,
    pub clock: Clock,
    pub events: EventSink,
    pub store: StateStore,
    pub auth_token: String,
    pub local: RwLock<LocalTables>,
    pub nets: Mutex<HashMap<NetworkId, NetworkState>>,
    pub binder: Binder,
    pub plane: Arc<PacketPlane>,
    pub engine: RwLock<Option<Arc<dyn OverlayEngine>>>,
    pub tap_factory: Arc<dyn TapFactory>,
    pub stack: Arc<dyn IpStack>,
    pub mapper: Option<Arc<dyn PortMapper>>,
    pub run: AtomicBool,
    pub term: Mutex<Termination>,
    pub control_tx: Sender<ControlMsg>,
    pub ports: Mutex<Ports>,
    pub next_deadline: AtomicI64,
    pub last_global_recv: AtomicI64,
    pub node_online: AtomicBool,
    pub peer_detector: Mutex<PeerDeltaDetector>,
    pub threads: Mutex<Vec<JoinHandle<()>>>,
    pub self_ref: Weak<ServiceInner>,
}

impl ServiceInner {
    pub(crate) fn engine(&self) -> Option<Arc<dyn OverlayEngine>> {
        self.engine.read().clone()
    }

    /// Pulls the background-task deadline earlier; the engine's own
    /// `process_background_tasks` result resets it authoritatively.
    pub(crate) fn update_deadline(&self, deadline: i64) {
        self.next_deadline.fetch_min(deadline, Ordering::Relaxed);
    }

    pub(crate) fn set_termination(&self, reason: TerminationReason, message: Option<String>) {
        {
            let mut term = self.term.lock();
            if term.reason == TerminationReason::StillRunning {
                *term = Termination { reason, message };
            }
        }
        self.run.store(false, Ordering::SeqCst);
        let _ = self.control_tx.send(ControlMsg::Wake);
    }

    pub(crate) fn fatal(&self, message: String) {
        log::error!("{}", message.red());
        self.set_termination(TerminationReason::UnrecoverableError, Some(message));
    }

    pub(crate) fn termination(&self) -> Termination {
        self.term.lock().clone()
    }

    pub(crate) fn handle_wire_packet(&self, socket: SocketId, from: SocketAddr, data: &[u8]) {
        let now = self.clock.now_ms();
        if data.len() >= 16 && scope_of(from.ip()) == IpScope::Global {
            self.last_global_recv.store(now, Ordering::Relaxed);
        }
        let Some(engine) = self.engine() else {
            return;
        };
        match engine.process_wire_packet(socket, from, data, now) {
            Ok(deadline) => self.update_deadline(deadline),
            Err(fault) => self.fatal(format!(
                "fatal error processing wire packet (code {}): {}",
                fault.code, fault.detail
            )),
        }
    }

    pub(crate) fn tap_frame(
        &self,
        nwid: NetworkId,
        src: MacAddr,
        dst: MacAddr,
        ethertype: u16,
        data: &[u8],
    ) {
        let Some(engine) = self.engine() else {
            return;
        };
        let now = self.clock.now_ms();
        match engine.process_virtual_frame(nwid, src, dst, ethertype, data, now) {
            Ok(deadline) => self.update_deadline(deadline),
            Err(fault) => self.fatal(format!(
                "fatal error processing tap frame (code {}): {}",
                fault.code, fault.detail
            )),
        }
    }

    fn bind_refresh_period(&self) -> i64 {
        if self.cfg.multipath.is_enabled() {
            BINDER_REFRESH_PERIOD_MS / 8
        } else {
            BINDER_REFRESH_PERIOD_MS
        }
    }

    /// Re-resolves the desired socket set and attaches a receive thread to
    /// every freshly bound socket.
    pub(crate) fn refresh_binder(&self) {
        let ports = self.ports.lock().nonzero();
        let (prefixes, blacklist_v4, blacklist_v6, explicit) = {
            let tables = self.local.read();
            (
                tables.interface_prefix_blacklist.clone(),
                tables.blacklist_v4.clone(),
                tables.blacklist_v6.clone(),
                tables.explicit_bind.clone(),
            )
        };
        let tap_addrs = self.tap_addresses();
        let filter = move |name: &str, addr: IpAddr| {
            should_bind_interface(name, addr, &prefixes, &blacklist_v4, &blacklist_v6, &tap_addrs)
        };

        let plane = self.plane.clone();
        let mut spawned = Vec::new();
        self.binder.refresh(&ports, &explicit, filter, |socket| {
            let plane = plane.clone();
            let name = format!("tapmesh-recv-{}", socket.id.0);
            match thread::Builder::new()
                .name(name)
                .spawn(move || plane.receive_loop(socket))
            {
                Ok(handle) => spawned.push(handle),
                Err(e) => log::warn!("cannot spawn receive thread: {e}"),
            }
        });
        self.threads.lock().extend(spawned);
    }

    /// Rebuilds the engine's view of our physical addresses from the port
    /// mapper's observed externals plus everything the binder has bound.
    fn push_interface_addresses(&self) {
        let Some(engine) = self.engine() else {
            return;
        };
        let mut addrs: Vec<SocketAddr> = self
            .mapper
            .as_ref()
            .map(|mapper| mapper.external_addresses())
            .unwrap_or_default();
        for local in self.binder.bound_locals() {
            if !addrs.contains(&local) {
                addrs.push(local);
            }
        }
        engine.set_interface_addresses(&addrs);
    }

    fn handle_control(&self, msg: ControlMsg) {
        match msg {
            ControlMsg::Wake => {},
            ControlMsg::Join(nwid) => {
                if let Some(engine) = self.engine() {
                    log::info!("joining network {}.", nwid.to_string().yellow());
                    if let Err(fault) = engine.join(nwid) {
                        log::warn!("cannot join {nwid}: {fault}");
                    }
                }
            },
            ControlMsg::Leave(nwid) => {
                if let Some(engine) = self.engine() {
                    log::info!("leaving network {}.", nwid.to_string().yellow());
                    if let Err(fault) = engine.leave(nwid) {
                        log::warn!("cannot leave {nwid}: {fault}");
                    }
                }
            },
            ControlMsg::SetNetworkSettings(nwid, settings) => {
                self.apply_network_settings(nwid, settings);
            },
        }
    }

    fn main_loop(&self, rx: &Receiver<ControlMsg>) {
        let start = self.clock.now_ms();
        let mut last_bind_refresh = start;
        let mut last_multipath_push = start - MULTIPATH_MODE_UPDATE_PERIOD_MS;
        let mut last_multicast_check = start;
        let mut last_interface_check =
            start - LOCAL_INTERFACE_CHECK_INTERVAL_MS + FIRST_INTERFACE_CHECK_DELAY_MS;
        let mut last_peer_cache_clean = start;
        let mut expected_wake = start;

        while self.run.load(Ordering::SeqCst) {
            let now = self.clock.now_ms();

            // A poller oversleep far past the requested delay means the host
            // slept; interfaces and NAT mappings are suspect.
            let restart = now - expected_wake > SLEEP_WAKE_GAP_MS;
            if restart {
                log::info!("woke from suspension, refreshing all bindings.");
            }

            if restart || now - last_bind_refresh >= self.bind_refresh_period() {
                last_bind_refresh = now;
                self.refresh_binder();
            }

            if restart || now - last_multipath_push >= MULTIPATH_MODE_UPDATE_PERIOD_MS {
                last_multipath_push = now;
                if let Some(engine) = self.engine() {
                    engine.set_multipath_mode(self.cfg.multipath);
                }
            }

            let any_ready = self.generate_network_events();
            if any_ready && self.node_online.load(Ordering::Relaxed) {
                if let Some(engine) = self.engine() {
                    let peers = engine.peers();
                    for event in self.peer_detector.lock().observe(&peers) {
                        self.events.emit(event);
                    }
                }
            }

            if self.next_deadline.load(Ordering::Relaxed) <= now {
                if let Some(engine) = self.engine() {
                    match engine.process_background_tasks(now) {
                        Ok(deadline) => self.next_deadline.store(deadline, Ordering::Relaxed),
                        Err(fault) => {
                            self.fatal(format!(
                                "fatal error in background tasks (code {}): {}",
                                fault.code, fault.detail
                            ));
                            continue;
                        },
                    }
                }
            }

            if now - last_multicast_check >= TAP_CHECK_MULTICAST_INTERVAL_MS {
                last_multicast_check = now;
                self.sync_multicast();
            }

            if now - last_interface_check >= LOCAL_INTERFACE_CHECK_INTERVAL_MS {
                last_interface_check = now;
                self.push_interface_addresses();
            }

            if now - last_peer_cache_clean >= PEER_CACHE_CLEAN_INTERVAL_MS {
                last_peer_cache_clean = now;
                self.store.clean_peer_cache(PEER_CACHE_MAX_AGE);
            }

            let deadline = self.next_deadline.load(Ordering::Relaxed);
            let sleep_ms = (deadline - now).clamp(MIN_LOOP_DELAY_MS, MAX_LOOP_DELAY_MS);
            expected_wake = self.clock.now_ms() + sleep_ms;
            match rx.recv_timeout(Duration::from_millis(sleep_ms as u64)) {
                Ok(msg) => {
                    self.handle_control(msg);
                    while let Ok(msg) = rx.try_recv() {
                        self.handle_control(msg);
                    }
                },
                Err(RecvTimeoutError::Timeout) => {},
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.set_termination(TerminationReason::NormalTermination, None);
    }

    fn shutdown(&self) {
        self.run.store(false, Ordering::SeqCst);
        self.binder.close_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        self.nets.lock().clear();
        *self.engine.write() = None;

        let termination = self.termination();
        match termination.reason {
            TerminationReason::NormalTermination => self.events.emit(Event::NodeNormalTermination),
            TerminationReason::UnrecoverableError => self.events.emit(Event::NodeUnrecoverableError {
                message: termination.message.clone().unwrap_or_default(),
            }),
            // The supervisor owns collision reporting; nothing for
            // StillRunning (can't happen past the loop).
            TerminationReason::IdentityCollision | TerminationReason::StillRunning => {},
        }
        self.events.emit(Event::NodeDown);
        log::info!("node service is down.");
    }
}

impl EngineHost for ServiceInner {
    fn state_get(&self, object: StateObject) -> Option<Vec<u8>> {
        self.store.get(object)
    }

    fn state_put(&self, object: StateObject, data: Option<&[u8]>) {
        if let Err(e) = self.store.put(object, data) {
            log::warn!("cannot persist {object:?}: {e}");
        }
    }

    fn wire_send(&self, local: Option<SocketId>, dest: SocketAddr, data: &[u8], ttl: u8) -> bool {
        if let Some(id) = local {
            if let Some(socket) = self.binder.socket_by_id(id) {
                if socket.live.load(Ordering::Relaxed) {
                    return socket.send_with_ttl(dest, data, ttl);
                }
            }
        }
        self.binder.send_all(dest, data, ttl)
    }

    fn virtual_frame(&self, nwid: NetworkId, src: MacAddr, dst: MacAddr, ethertype: u16, data: &[u8]) {
        let tap = self
            .nets
            .lock()
            .get(&nwid)
            .and_then(|state| state.tap.clone());
        match tap {
            Some(tap) => tap.put(src, dst, ethertype, data),
            None => log::trace!("dropping frame for unknown network {nwid}"),
        }
    }

    fn network_config(&self, op: ConfigOp, config: VirtualNetworkConfig) -> i32 {
        self.handle_network_config(op, config)
    }

    fn event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Up => self.events.emit(Event::NodeUp),
            EngineEvent::Online => {
                self.node_online.store(true, Ordering::Relaxed);
                self.events.emit(Event::NodeOnline);
            },
            EngineEvent::Offline => {
                self.node_online.store(false, Ordering::Relaxed);
                self.events.emit(Event::NodeOffline);
            },
            // The service reports NODE_DOWN itself once shutdown completes.
            EngineEvent::Down => log::debug!("engine reported down"),
            EngineEvent::FatalIdentityCollision => {
                log::error!("{}", "identity collision detected on the network".red());
                self.set_termination(TerminationReason::IdentityCollision, None);
            },
            EngineEvent::Fatal { code } => {
                self.fatal(format!("fatal engine event (code {code})"));
            },
        }
    }

    fn path_check(&self, peer: PeerAddr, _local: Option<SocketId>, remote: SocketAddr) -> bool {
        self.check_path(peer, remote)
    }

    fn path_lookup(&self, peer: PeerAddr, family: Option<AddressFamily>) -> Option<SocketAddr> {
        self.lookup_path(peer, family)
    }
}

/// A cloneable handle onto a running (or terminated) service.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<ServiceInner>,
}

impl NodeHandle {
    /// Requests graceful shutdown; idempotent, returns immediately.
    pub fn terminate(&self) {
        self.inner.run.store(false, Ordering::SeqCst);
        let _ = self.inner.control_tx.send(ControlMsg::Wake);
    }

    pub fn termination(&self) -> Termination {
        self.inner.termination()
    }

    /// Asks the engine to join a network; the UP/UPDATE callbacks drive the
    /// rest. Processed on the service thread.
    pub fn join_network(&self, nwid: NetworkId) {
        let _ = self.inner.control_tx.send(ControlMsg::Join(nwid));
    }

    pub fn leave_network(&self, nwid: NetworkId) {
        let _ = self.inner.control_tx.send(ControlMsg::Leave(nwid));
    }

    /// Replaces a network's managed-address policy and re-reconciles.
    pub fn set_network_settings(&self, nwid: NetworkId, settings: NetworkSettings) {
        let _ = self
            .inner
            .control_tx
            .send(ControlMsg::SetNetworkSettings(nwid, settings));
    }

    pub fn ports(&self) -> Ports {
        *self.inner.ports.lock()
    }

    pub fn auth_token(&self) -> String {
        self.inner.auth_token.clone()
    }

    /// Inbound packets dropped because the pool or queue was exhausted.
    pub fn dropped_packets(&self) -> u64 {
        self.inner.plane.dropped.load(Ordering::Relaxed)
    }

    /// Monotonic ms of the last ≥16-byte datagram from a globally routable
    /// source, 0 if none yet.
    pub fn last_global_receive_ms(&self) -> i64 {
        self.inner.last_global_recv.load(Ordering::Relaxed)
    }

    pub fn allowed_management_sources(&self) -> Vec<IpNet> {
        self.inner.local.read().allowed_management.clone()
    }
}

/// A running node service. Dropping it terminates the service and joins the
/// service thread.
pub struct Node {
    handle: NodeHandle,
    thread: Option<JoinHandle<()>>,
}

impl Deref for Node {
    type Target = NodeHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Node {
    /// Brings the service up: home directory and auth token, local config,
    /// the engine (via `engine_factory`), port selection, initial binding,
    /// the packet worker pool, and finally the control-loop thread.
    ///
    /// Lifecycle and state-change events are delivered on `events`.
    pub fn start(
        home: &Path,
        config: ServiceConfig,
        events: Sender<Event>,
        engine_factory: EngineFactory,
        tap_factory: Arc<dyn TapFactory>,
        stack: Arc<dyn IpStack>,
        mapper: Option<Arc<dyn PortMapper>>,
    ) -> Result<Self, Error> {
        let events = EventSink::new(events);
        let store = StateStore::open(
            home,
            config.allow_network_caching(),
            config.allow_peer_caching(),
        )?;
        let auth_token = store::load_auth_token(home)?;
        let local_config = if config.allow_local_conf() {
            LocalConfig::load(home)?
        } else {
            LocalConfig::default()
        };
        let tables = LocalTables::build(&config, &local_config);
        let (control_tx, control_rx) = unbounded();

        let inner = Arc::new_cyclic(|weak| ServiceInner {
            cfg: config.clone(),
            home: home.to_path_buf(),
            clock: Clock::new(),
            events,
            store,
            auth_token,
            local: RwLock::new(tables),
            nets: Mutex::new(HashMap::new()),
            binder: Binder::new(),
            plane: Arc::new(PacketPlane::new()),
            engine: RwLock::new(None),
            tap_factory,
            stack,
            mapper,
            run: AtomicBool::new(true),
            term: Mutex::new(Termination {
                reason: TerminationReason::StillRunning,
                message: None,
            }),
            control_tx,
            ports: Mutex::new(Ports::default()),
            next_deadline: AtomicI64::new(0),
            last_global_recv: AtomicI64::new(0),
            node_online: AtomicBool::new(false),
            peer_detector: Mutex::new(PeerDeltaDetector::new()),
            threads: Mutex::new(Vec::new()),
            self_ref: weak.clone(),
        });

        log::info!(
            "starting node service in {}.",
            home.to_string_lossy().yellow()
        );
        let engine = engine_factory(inner.clone())?;
        *inner.engine.write() = Some(engine.clone());

        let primary = match ports::select_primary(config.primary_port) {
            Some(port) => port,
            None => {
                let message = "cannot bind to local control interface port";
                inner.set_termination(
                    TerminationReason::UnrecoverableError,
                    Some(message.to_string()),
                );
                inner.events.emit(Event::NodeUnrecoverableError {
                    message: message.to_string(),
                });
                *inner.engine.write() = None;
                bail!(message);
            },
        };
        let secondary_start = if config.secondary_port != 0 {
            config.secondary_port
        } else {
            ports::derived_start(engine.address())
        };
        let secondary = ports::select_derived(secondary_start);
        let mapping = if config.port_mapping() {
            let start = if config.mapping_port != 0 {
                config.mapping_port
            } else {
                secondary
            };
            let port = ports::select_derived(start);
            if port != 0 {
                if let Some(mapper) = &inner.mapper {
                    mapper.set_local_port(port);
                }
            }
            port
        } else {
            0
        };
        *inner.ports.lock() = Ports {
            primary,
            secondary,
            mapping,
        };
        log::info!(
            "selected ports: primary {}, secondary {}, mapping {}.",
            primary.to_string().yellow(),
            secondary,
            mapping
        );

        {
            let queue = inner.plane.queue();
            let mut threads = Vec::new();
            for index in 0..config.packet_workers.max(1) {
                let worker_inner = inner.clone();
                let worker_queue = queue.clone();
                let handle = thread::Builder::new()
                    .name(format!("tapmesh-worker-{index}"))
                    .spawn(move || packet_worker(worker_inner, worker_queue))?;
                threads.push(handle);
            }
            inner.threads.lock().extend(threads);
        }

        inner.refresh_binder();

        let service_inner = inner.clone();
        let thread = thread::Builder::new()
            .name("tapmesh-service".to_string())
            .spawn(move || run_service(service_inner, control_rx))?;

        Ok(Self {
            handle: NodeHandle { inner },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Blocks until the service thread exits, then reports why.
    pub fn wait(mut self) -> Termination {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.handle.termination()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.terminate();
            let _ = thread.join();
        }
    }
}

fn run_service(inner: Arc<ServiceInner>, rx: Receiver<ControlMsg>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| inner.main_loop(&rx)));
    if let Err(payload) = result {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        inner.set_termination(
            TerminationReason::UnrecoverableError,
            Some(format!("unexpected exception in main thread: {detail}")),
        );
    }
    inner.shutdown();
}

fn packet_worker(inner: Arc<ServiceInner>, queue: Receiver<InboundPacket>) {
    while inner.run.load(Ordering::SeqCst) {
        match queue.recv_timeout(Duration::from_millis(500)) {
            Ok(packet) => {
                let InboundPacket {
                    socket,
                    from,
                    buf,
                    len,
                } = packet;
                inner.handle_wire_packet(socket, from, &buf[..len]);
                inner.plane.return_buffer(buf);
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
        assert!(a >= 0);
    }
}
