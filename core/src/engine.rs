//! Interfaces to the service's out-of-scope collaborators: the overlay
//! protocol engine, the userspace IP stack, and the port mapper.
//!
//! The engine is handed a single capability object ([`EngineHost`]) at
//! construction time and calls back through it for everything it needs from
//! its host: persistent state, wire sends, tap frames, network config
//! transitions, and path decisions. The service in turn drives the engine
//! through [`OverlayEngine`]. Both sides speak in monotonic milliseconds
//! measured from service start.

use ipnet::IpNet;
use std::{fmt, net::SocketAddr, sync::Arc};
use tap_control::{MacAddr, MulticastGroup};
use tapmesh_shared::{Error, ManagedRoute, NetworkId, PeerAddr};
use thiserror::Error as ThisError;

/// Identifies one bound UDP socket for the lifetime of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Multipath link-aggregation mode pushed into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MultipathMode {
    #[default]
    Disabled,
    ActiveBackup,
    Balance,
}

impl fmt::Display for MultipathMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::ActiveBackup => f.write_str("active-backup"),
            Self::Balance => f.write_str("balance"),
        }
    }
}

impl MultipathMode {
    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}

/// A fatal condition reported by the engine from one of its synchronous
/// entry points.
#[derive(Debug, Clone, ThisError)]
#[error("engine fault {code}: {detail}")]
pub struct EngineFault {
    pub code: i64,
    pub detail: String,
}

impl EngineFault {
    pub fn new(code: i64, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// The operation the engine is performing on a virtual network when it
/// invokes the config callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOp {
    Up,
    Update,
    Down,
    Destroy,
}

/// Controller-reported status of a joined network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    RequestingConfiguration,
    Ok,
    AccessDenied,
    NotFound,
    ClientTooOld,
}

/// Snapshot of a virtual network's configuration as most recently received
/// from its controller.
#[derive(Debug, Clone)]
pub struct VirtualNetworkConfig {
    pub nwid: NetworkId,
    pub name: String,
    pub mac: MacAddr,
    pub mtu: u32,
    pub status: NetworkStatus,
    pub assigned_addresses: Vec<IpNet>,
    pub routes: Vec<ManagedRoute>,
    pub multicast_subscriptions: Vec<MulticastGroup>,
}

/// One peer from the engine's peer-table snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    pub addr: PeerAddr,
    pub direct_paths: usize,
}

/// Lifecycle and trace events the engine reports to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Up,
    Online,
    Offline,
    Down,
    FatalIdentityCollision,
    Fatal { code: i64 },
}

/// A persistent state object owned by the engine but stored by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateObject {
    IdentityPublic,
    IdentitySecret,
    Planet,
    NetworkConfig(NetworkId),
    Peer(PeerAddr),
}

/// Returned from the network-config callback when the host's network table
/// is in a state the engine should treat as a hard rejection.
pub const NETWORK_CONFIG_SANITY_ERROR: i32 = -999;

/// The overlay protocol engine, as driven by the service.
///
/// The service thread is the sole caller of every method except
/// `process_wire_packet`, for which implementations must be internally
/// thread-safe (the packet worker pool calls it concurrently).
///
/// `process_*` and `process_background_tasks` return the monotonic deadline
/// (ms) at which the engine next wants `process_background_tasks` called.
pub trait OverlayEngine: Send + Sync {
    fn process_wire_packet(
        &self,
        local: SocketId,
        from: SocketAddr,
        data: &[u8],
        now: i64,
    ) -> Result<i64, EngineFault>;

    fn process_virtual_frame(
        &self,
        nwid: NetworkId,
        src: MacAddr,
        dst: MacAddr,
        ethertype: u16,
        data: &[u8],
        now: i64,
    ) -> Result<i64, EngineFault>;

    fn process_background_tasks(&self, now: i64) -> Result<i64, EngineFault>;

    fn join(&self, nwid: NetworkId) -> Result<(), EngineFault>;

    fn leave(&self, nwid: NetworkId) -> Result<(), EngineFault>;

    fn multicast_subscribe(&self, nwid: NetworkId, group: MulticastGroup);

    fn multicast_unsubscribe(&self, nwid: NetworkId, group: MulticastGroup);

    /// A snapshot of the engine's peer table; dropping the returned vector
    /// releases it.
    fn peers(&self) -> Vec<PeerView>;

    /// Replaces the set of physical addresses the engine advertises as its
    /// own.
    fn set_interface_addresses(&self, addrs: &[SocketAddr]);

    fn set_multipath_mode(&self, mode: MultipathMode);

    /// This node's overlay address, fixed once the identity is loaded.
    fn address(&self) -> PeerAddr;

    /// The engine's PRNG, used wherever the host needs randomness that must
    /// be deterministic under the engine's own test seeding.
    fn prng_u64(&self) -> u64;
}

/// The capability object the engine calls back into. Implemented by the
/// service; handed to the engine factory exactly once.
pub trait EngineHost: Send + Sync {
    fn state_get(&self, object: StateObject) -> Option<Vec<u8>>;

    /// `None` deletes the object.
    fn state_put(&self, object: StateObject, data: Option<&[u8]>);

    /// Sends `data` to `dest`. `local` of `None` means "any socket"; a TTL
    /// of zero means "default". Returns false if nothing could be sent.
    fn wire_send(&self, local: Option<SocketId>, dest: SocketAddr, data: &[u8], ttl: u8) -> bool;

    /// Delivers a decrypted Ethernet frame destined for a joined network's
    /// tap.
    fn virtual_frame(&self, nwid: NetworkId, src: MacAddr, dst: MacAddr, ethertype: u16, data: &[u8]);

    /// Notifies the host of a network lifecycle transition. Returns 0 on
    /// success or [`NETWORK_CONFIG_SANITY_ERROR`].
    fn network_config(&self, op: ConfigOp, config: VirtualNetworkConfig) -> i32;

    fn event(&self, event: EngineEvent);

    /// May the engine use the path `(peer, local, remote)`?
    fn path_check(&self, peer: PeerAddr, local: Option<SocketId>, remote: SocketAddr) -> bool;

    /// An operator-configured hint address for `peer`, if one exists.
    /// `family` of `None` lets the host pick a family with the engine's
    /// PRNG.
    fn path_lookup(&self, peer: PeerAddr, family: Option<AddressFamily>) -> Option<SocketAddr>;
}

/// Builds the engine around the host capability object. Engines are expected
/// to load (or create) their identity through `state_get`/`state_put` during
/// construction and to report [`EngineEvent::Up`] once initialized.
pub type EngineFactory =
    Box<dyn FnOnce(Arc<dyn EngineHost>) -> Result<Arc<dyn OverlayEngine>, Error> + Send>;

/// Readiness probe for the userspace IP stack bound to a network's tap.
pub trait IpStack: Send + Sync {
    fn netif_up(&self, nwid: NetworkId) -> bool;
}

/// Opaque uPnP/NAT-PMP port mapper. Only consulted when port mapping is
/// enabled in the service configuration.
pub trait PortMapper: Send + Sync {
    fn set_local_port(&self, port: u16);

    /// Externally observed (mapped) addresses, if any have been learned.
    fn external_addresses(&self) -> Vec<SocketAddr>;
}
