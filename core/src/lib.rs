//! The tapmesh node service.
//!
//! This crate hosts an opaque overlay protocol engine and connects it to the
//! physical network (UDP sockets picked by a trial binder), to virtual tap
//! devices (one per joined network), and to a persistent home directory.
//! Embedders construct a [`Node`] with an engine factory, a tap factory, and
//! an IP-stack readiness probe, then drain the event channel.

pub use crossbeam_channel as channel;

pub mod config;
pub mod engine;
pub mod events;
pub mod service;
pub mod supervisor;

mod binder;
mod nets;
mod packet;
mod paths;
mod peers;
mod ports;
mod store;

pub use config::{LocalConfig, ServiceConfig};
pub use events::Event;
pub use ports::{trial_bind, Ports};
pub use service::{Node, NodeHandle, Termination, TerminationReason};
pub use supervisor::Supervisor;

/// How often bound sockets are reconciled against the current set of local
/// interface addresses. Divided by 8 when multipath is active.
pub(crate) const BINDER_REFRESH_PERIOD_MS: i64 = 30_000;

/// How often the multipath mode is re-pushed into the engine.
pub(crate) const MULTIPATH_MODE_UPDATE_PERIOD_MS: i64 = 5_000;

/// How often each tap is scanned for multicast subscription changes.
pub(crate) const TAP_CHECK_MULTICAST_INTERVAL_MS: i64 = 5_000;

/// How often the engine's local address set is rebuilt from the port mapper
/// and the binder.
pub(crate) const LOCAL_INTERFACE_CHECK_INTERVAL_MS: i64 = 60_000;

/// The first interface-address push happens this long after startup.
pub(crate) const FIRST_INTERFACE_CHECK_DELAY_MS: i64 = 15_000;

/// Cached peer state files are reaped this often...
pub(crate) const PEER_CACHE_CLEAN_INTERVAL_MS: i64 = 3_600_000;

/// ...when older than this.
pub(crate) const PEER_CACHE_MAX_AGE: std::time::Duration =
    std::time::Duration::from_secs(30 * 24 * 60 * 60);

/// An oversleep of the control loop beyond the requested delay plus this gap
/// is treated as a sleep/wake cycle and forces a full refresh.
pub(crate) const SLEEP_WAKE_GAP_MS: i64 = 10_000;

/// Bounds on the control-loop poller sleep, independent of the engine's
/// reported background-task deadline.
pub(crate) const MIN_LOOP_DELAY_MS: i64 = 10;
pub(crate) const MAX_LOOP_DELAY_MS: i64 = 500;
