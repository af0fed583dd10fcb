//! Operator path configuration and the engine's path check / path lookup
//! queries.

use crate::config::{LocalConfig, ServiceConfig};
use crate::engine::AddressFamily;
use crate::service::ServiceInner;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::{
    collections::HashMap,
    net::{SocketAddr, SocketAddrV4, SocketAddrV6},
};
use tapmesh_shared::{NetworkId, NetworkSettings, PeerAddr};

/// Runtime tables derived from the service options and `local.conf`,
/// consulted by the interface filter and the path check/lookup callbacks.
#[derive(Default)]
pub(crate) struct LocalTables {
    pub interface_prefix_blacklist: Vec<String>,
    pub blacklist_v4: Vec<Ipv4Net>,
    pub blacklist_v6: Vec<Ipv6Net>,
    pub allowed_management: Vec<IpNet>,
    pub explicit_bind: Vec<SocketAddr>,
    pub v4_hints: HashMap<PeerAddr, Vec<SocketAddrV4>>,
    pub v6_hints: HashMap<PeerAddr, Vec<SocketAddrV6>>,
    pub peer_blacklists: HashMap<PeerAddr, Vec<IpNet>>,
    pub network_settings: HashMap<NetworkId, NetworkSettings>,
}

impl LocalTables {
    pub fn build(config: &ServiceConfig, local: &LocalConfig) -> Self {
        let mut tables = Self {
            interface_prefix_blacklist: config.interface_prefix_blacklist.clone(),
            blacklist_v4: local.blacklist_v4.clone(),
            blacklist_v6: local.blacklist_v6.clone(),
            allowed_management: local.allowed_management.clone(),
            explicit_bind: config.bind.clone(),
            ..Default::default()
        };
        tables
            .interface_prefix_blacklist
            .extend(local.interface_prefix_blacklist.iter().cloned());
        tables.explicit_bind.extend(local.bind.iter().cloned());

        for peer in &local.peers {
            for endpoint in &peer.try_endpoints {
                match endpoint {
                    SocketAddr::V4(v4) => {
                        tables.v4_hints.entry(peer.address).or_default().push(*v4)
                    },
                    SocketAddr::V6(v6) => {
                        tables.v6_hints.entry(peer.address).or_default().push(*v6)
                    },
                }
            }
            if !peer.blacklist.is_empty() {
                tables
                    .peer_blacklists
                    .insert(peer.address, peer.blacklist.clone());
            }
        }
        for network in &local.networks {
            tables
                .network_settings
                .insert(network.id, network.settings.clone());
        }
        tables
    }

    fn globally_blacklisted(&self, addr: std::net::IpAddr) -> bool {
        match addr {
            std::net::IpAddr::V4(v4) => self.blacklist_v4.iter().any(|net| net.contains(&v4)),
            std::net::IpAddr::V6(v6) => self.blacklist_v6.iter().any(|net| net.contains(&v6)),
        }
    }
}

impl ServiceInner {
    /// May the engine use `remote` to reach `peer`? Rejects remotes inside
    /// any of our own taps' networks (overlay-over-overlay recursion), then
    /// applies the per-peer and family-wide blacklists.
    pub(crate) fn check_path(&self, peer: PeerAddr, remote: SocketAddr) -> bool {
        let remote_ip = remote.ip();
        if self.tap_networks().iter().any(|net| net.contains(&remote_ip)) {
            log::trace!("path {remote} for {peer} rejected: inside an owned tap network");
            return false;
        }

        let tables = self.local.read();
        if let Some(blacklist) = tables.peer_blacklists.get(&peer) {
            if blacklist.iter().any(|net| net.contains(&remote_ip)) {
                return false;
            }
        }
        if tables.globally_blacklisted(remote_ip) {
            return false;
        }
        true
    }

    /// An operator-configured hint address for `peer`. With no family
    /// restriction the engine's PRNG picks which table to consult; within a
    /// table the hint is chosen uniformly at random with the same PRNG.
    pub(crate) fn lookup_path(
        &self,
        peer: PeerAddr,
        family: Option<AddressFamily>,
    ) -> Option<SocketAddr> {
        let engine = self.engine()?;
        let family = family.unwrap_or_else(|| {
            if engine.prng_u64() & 1 == 0 {
                AddressFamily::V4
            } else {
                AddressFamily::V6
            }
        });

        let tables = self.local.read();
        match family {
            AddressFamily::V4 => {
                let hints = tables.v4_hints.get(&peer)?;
                if hints.is_empty() {
                    return None;
                }
                let pick = engine.prng_u64() as usize % hints.len();
                Some(SocketAddr::V4(hints[pick]))
            },
            AddressFamily::V6 => {
                let hints = tables.v6_hints.get(&peer)?;
                if hints.is_empty() {
                    return None;
                }
                let pick = engine.prng_u64() as usize % hints.len();
                Some(SocketAddr::V6(hints[pick]))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerLocalConfig;

    #[test]
    fn test_tables_merge_config_and_local() {
        let config = ServiceConfig {
            interface_prefix_blacklist: vec!["docker".into()],
            bind: vec!["192.0.2.1:9413".parse().unwrap()],
            ..Default::default()
        };
        let local = LocalConfig {
            interface_prefix_blacklist: vec!["veth".into()],
            bind: vec!["192.0.2.2:9413".parse().unwrap()],
            peers: vec![PeerLocalConfig {
                address: PeerAddr(0x89e92ceee5),
                try_endpoints: vec![
                    "203.0.113.10:9413".parse().unwrap(),
                    "[2001:4860::1]:9413".parse().unwrap(),
                ],
                blacklist: vec!["10.10.0.0/16".parse().unwrap()],
            }],
            ..Default::default()
        };

        let tables = LocalTables::build(&config, &local);
        assert_eq!(tables.interface_prefix_blacklist, vec!["docker", "veth"]);
        assert_eq!(tables.explicit_bind.len(), 2);
        assert_eq!(tables.v4_hints[&PeerAddr(0x89e92ceee5)].len(), 1);
        assert_eq!(tables.v6_hints[&PeerAddr(0x89e92ceee5)].len(), 1);
        assert!(tables.peer_blacklists.contains_key(&PeerAddr(0x89e92ceee5)));
    }

    #[test]
    fn test_global_blacklist_lookup() {
        let tables = LocalTables {
            blacklist_v4: vec!["192.168.100.0/24".parse().unwrap()],
            ..Default::default()
        };
        assert!(tables.globally_blacklisted("192.168.100.44".parse().unwrap()));
        assert!(!tables.globally_blacklisted("192.168.101.44".parse().unwrap()));
        assert!(!tables.globally_blacklisted("fd00::1".parse().unwrap()));
    }
}
