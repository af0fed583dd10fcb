//! Per-network state: tap lifecycle, managed address reconciliation, and
//! status/readiness event edges.

use crate::engine::{
    ConfigOp, NetworkStatus, StateObject, VirtualNetworkConfig, NETWORK_CONFIG_SANITY_ERROR,
};
use crate::events::Event;
use crate::service::ServiceInner;
use colored::*;
use ipnet::IpNet;
use std::{io, sync::Arc};
use tap_control::{FrameSink, MacAddr, MulticastGroup, Tap};
use tapmesh_shared::{scope_of, IpScope, ManagedRoute, NetworkId, NetworkSettings};

pub(crate) struct NetworkState {
    pub config: VirtualNetworkConfig,
    pub tap: Option<Arc<dyn Tap>>,
    /// Mirror of the policy-admitted addresses installed on the tap;
    /// sorted, deduplicated.
    pub managed_ips: Vec<IpNet>,
    pub managed_routes: Vec<ManagedRoute>,
    pub settings: NetworkSettings,
    /// Status last reported upward; events fire only on edges.
    pub last_status: Option<NetworkStatus>,
    pub ready_v4: bool,
    pub ready_v6: bool,
}

/// The managed-address policy. A target survives only if managed installs
/// are enabled at all, it clears the whitelist (when one is configured),
/// and its scope is acceptable.
pub(crate) fn managed_is_allowed(settings: &NetworkSettings, target: &IpNet) -> bool {
    if !settings.allow_managed {
        return false;
    }
    if !settings.allow_managed_whitelist.is_empty()
        && !settings
            .allow_managed_whitelist
            .iter()
            .any(|allowed| allowed.prefix_len() <= target.prefix_len() && allowed.contains(target))
    {
        return false;
    }
    if target.prefix_len() == 0 {
        // 0.0.0.0/0 or ::/0.
        return settings.allow_default;
    }
    match scope_of(target.addr()) {
        IpScope::None | IpScope::Multicast | IpScope::Loopback | IpScope::LinkLocal => false,
        IpScope::Global => settings.allow_global,
        IpScope::Private | IpScope::Shared => true,
    }
}

pub(crate) struct ManagedDiff {
    pub added: Vec<IpNet>,
    pub removed: Vec<IpNet>,
}

/// Applies the diff between the policy-filtered assigned set and the
/// currently managed set to the tap. Returns the new managed set (always
/// the full target set) and the adds/removes that actually took on the tap.
pub(crate) fn reconcile_managed_ips(
    tap: &dyn Tap,
    settings: &NetworkSettings,
    assigned: &[IpNet],
    current: &[IpNet],
) -> (Vec<IpNet>, ManagedDiff) {
    let mut target: Vec<IpNet> = assigned
        .iter()
        .filter(|addr| managed_is_allowed(settings, addr))
        .cloned()
        .collect();
    target.sort();
    target.dedup();

    let mut diff = ManagedDiff {
        added: Vec::new(),
        removed: Vec::new(),
    };

    for addr in current {
        if !target.contains(addr) {
            match tap.remove_ip(*addr) {
                Ok(()) => diff.removed.push(*addr),
                Err(e) => log::warn!("cannot remove {} from {}: {}", addr, tap.device_name(), e),
            }
        }
    }
    for addr in &target {
        if !current.contains(addr) {
            match tap.add_ip(*addr) {
                Ok(()) => diff.added.push(*addr),
                Err(e) => log::warn!("cannot add {} to {}: {}", addr, tap.device_name(), e),
            }
        }
    }

    (target, diff)
}

fn status_event(nwid: NetworkId, status: NetworkStatus) -> Event {
    match status {
        NetworkStatus::RequestingConfiguration => Event::NetworkReqConfig { nwid },
        NetworkStatus::Ok => Event::NetworkOk { nwid },
        NetworkStatus::AccessDenied => Event::NetworkAccessDenied { nwid },
        NetworkStatus::NotFound => Event::NetworkNotFound { nwid },
        NetworkStatus::ClientTooOld => Event::NetworkClientTooOld { nwid },
    }
}

fn addr_event(nwid: NetworkId, addr: IpNet, added: bool) -> Event {
    match (addr, added) {
        (IpNet::V4(addr), true) => Event::AddrAddedIp4 { nwid, addr },
        (IpNet::V4(addr), false) => Event::AddrRemovedIp4 { nwid, addr },
        (IpNet::V6(addr), true) => Event::AddrAddedIp6 { nwid, addr },
        (IpNet::V6(addr), false) => Event::AddrRemovedIp6 { nwid, addr },
    }
}

impl ServiceInner {
    /// The engine's network lifecycle callback (UP / UPDATE / DOWN /
    /// DESTROY). Serialized per network by the table lock.
    pub(crate) fn handle_network_config(&self, op: ConfigOp, config: VirtualNetworkConfig) -> i32 {
        let nwid = config.nwid;
        let mut nets = self.nets.lock();
        match op {
            ConfigOp::Up | ConfigOp::Update => {
                let state = nets.entry(nwid).or_insert_with(|| NetworkState {
                    config: config.clone(),
                    tap: None,
                    managed_ips: Vec::new(),
                    managed_routes: Vec::new(),
                    settings: self.default_network_settings(nwid),
                    last_status: None,
                    ready_v4: false,
                    ready_v6: false,
                });

                if op == ConfigOp::Up && state.tap.is_none() {
                    let friendly_name = format!("Overlay [{nwid}]");
                    match self.open_tap(nwid, config.mac, config.mtu, &friendly_name) {
                        Ok(tap) => {
                            log::info!(
                                "network {} is up on {}.",
                                nwid.to_string().yellow(),
                                tap.device_name()
                            );
                            state.tap = Some(tap);
                        },
                        Err(e) => {
                            log::error!("cannot create tap for {nwid}: {e}");
                            nets.remove(&nwid);
                            return NETWORK_CONFIG_SANITY_ERROR;
                        },
                    }
                }
                if state.tap.is_none() {
                    // An UPDATE for a network that never saw an UP.
                    nets.remove(&nwid);
                    return NETWORK_CONFIG_SANITY_ERROR;
                }

                state.config = config;
                if op == ConfigOp::Update {
                    self.events.emit(Event::NetworkUpdate { nwid });
                }
                self.sync_managed(nwid, state);
                let status = state.config.status;
                if let Some(tap) = &state.tap {
                    tap.set_mtu(state.config.mtu);
                    if state.last_status != Some(status) {
                        tap.set_network_status(status == NetworkStatus::Ok);
                    }
                }
                if state.last_status != Some(status) {
                    state.last_status = Some(status);
                    if status != NetworkStatus::Ok {
                        state.ready_v4 = false;
                        state.ready_v6 = false;
                    }
                    self.events.emit(status_event(nwid, status));
                }
                0
            },
            ConfigOp::Down | ConfigOp::Destroy => {
                if nets.remove(&nwid).is_some() {
                    log::info!("network {} is down.", nwid.to_string().yellow());
                }
                if op == ConfigOp::Destroy {
                    if let Err(e) = self.store.put(StateObject::NetworkConfig(nwid), None) {
                        log::warn!("cannot delete cached config for {nwid}: {e}");
                    }
                }
                0
            },
        }
    }

    fn open_tap(
        &self,
        nwid: NetworkId,
        mac: MacAddr,
        mtu: u32,
        friendly_name: &str,
    ) -> io::Result<Arc<dyn Tap>> {
        let weak = self.self_ref.clone();
        let sink: FrameSink = Arc::new(move |src, dst, ethertype, data| {
            if let Some(inner) = weak.upgrade() {
                inner.tap_frame(nwid, src, dst, ethertype, data);
            }
        });
        self.tap_factory.open(nwid.0, mac, mtu, friendly_name, sink)
    }

    /// Reconciles managed addresses and routes for one network and emits
    /// address events. Fixed point: running this twice with an unchanged
    /// config performs no tap operations the second time.
    pub(crate) fn sync_managed(&self, nwid: NetworkId, state: &mut NetworkState) {
        let Some(tap) = state.tap.clone() else {
            return;
        };
        let (target, diff) = reconcile_managed_ips(
            tap.as_ref(),
            &state.settings,
            &state.config.assigned_addresses,
            &state.managed_ips,
        );
        for addr in diff.removed {
            self.events.emit(addr_event(nwid, addr, false));
        }
        for addr in diff.added {
            self.events.emit(addr_event(nwid, addr, true));
        }
        state.managed_ips = target;

        let mut routes: Vec<ManagedRoute> = state
            .config
            .routes
            .iter()
            .filter(|route| managed_is_allowed(&state.settings, &route.target))
            .cloned()
            .collect();
        routes.sort();
        routes.dedup();
        state.managed_routes = routes;
    }

    /// Emits readiness edges for every network whose controller status is OK
    /// and whose IP stack reports the netif up. Returns whether any network
    /// is ready, which gates peer delta detection.
    pub(crate) fn generate_network_events(&self) -> bool {
        let mut any_ready = false;
        let mut nets = self.nets.lock();
        for (nwid, state) in nets.iter_mut() {
            let Some(tap) = state.tap.clone() else {
                continue;
            };
            if state.last_status == Some(NetworkStatus::Ok) && self.stack.netif_up(*nwid) {
                if !state.ready_v4 && tap.has_ipv4_addr() {
                    state.ready_v4 = true;
                    self.events.emit(Event::NetworkReadyIp4 { nwid: *nwid });
                }
                if !state.ready_v6 && tap.has_ipv6_addr() {
                    state.ready_v6 = true;
                    self.events.emit(Event::NetworkReadyIp6 { nwid: *nwid });
                }
            }
            any_ready |= state.ready_v4 || state.ready_v6;
        }
        any_ready
    }

    /// Scans every tap for multicast membership changes and mirrors them
    /// into the engine. Engine calls happen after the table lock is
    /// released.
    pub(crate) fn sync_multicast(&self) {
        let work: Vec<(NetworkId, Vec<MulticastGroup>, Vec<MulticastGroup>)> = {
            let nets = self.nets.lock();
            nets.iter()
                .filter_map(|(nwid, state)| {
                    let tap = state.tap.as_ref()?;
                    let (mut added, mut removed) = (Vec::new(), Vec::new());
                    tap.scan_multicast_groups(&mut added, &mut removed);
                    (!added.is_empty() || !removed.is_empty()).then_some((*nwid, added, removed))
                })
                .collect()
        };
        if work.is_empty() {
            return;
        }
        let Some(engine) = self.engine() else {
            return;
        };
        for (nwid, added, removed) in work {
            for group in added {
                engine.multicast_subscribe(nwid, group);
            }
            for group in removed {
                engine.multicast_unsubscribe(nwid, group);
            }
        }
    }

    /// Every address currently installed on any owned tap.
    pub(crate) fn tap_addresses(&self) -> Vec<std::net::IpAddr> {
        self.nets
            .lock()
            .values()
            .filter_map(|state| state.tap.as_ref())
            .flat_map(|tap| tap.ips())
            .map(|net| net.addr())
            .collect()
    }

    /// Every network (with prefix) currently installed on any owned tap.
    pub(crate) fn tap_networks(&self) -> Vec<IpNet> {
        self.nets
            .lock()
            .values()
            .filter_map(|state| state.tap.as_ref())
            .flat_map(|tap| tap.ips())
            .collect()
    }

    pub(crate) fn default_network_settings(&self, nwid: NetworkId) -> NetworkSettings {
        self.local
            .read()
            .network_settings
            .get(&nwid)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces a network's policy and re-reconciles immediately if the
    /// network is live.
    pub(crate) fn apply_network_settings(&self, nwid: NetworkId, settings: NetworkSettings) {
        self.local
            .write()
            .network_settings
            .insert(nwid, settings.clone());
        let mut nets = self.nets.lock();
        if let Some(state) = nets.get_mut(&nwid) {
            state.settings = settings;
            self.sync_managed(nwid, state);
        }
    }
}
