//! Service configuration: embedder-facing options plus the optional
//! `local.conf` file read from the home directory.

use crate::engine::MultipathMode;
use clap::Args;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path};
use tapmesh_shared::{Error, IoErrorContext, NetworkId, NetworkSettings, PeerAddr};

/// Options controlling a single service instance. Front-ends can flatten
/// this straight into their CLI.
#[derive(Clone, Debug, Args)]
pub struct ServiceConfig {
    /// The primary UDP port (0 picks a random port in [20000, 65500))
    #[clap(short, long, default_value_t = 0)]
    pub primary_port: u16,

    /// Override the derived secondary port (0 derives it from the node
    /// address)
    #[clap(long, default_value_t = 0)]
    pub secondary_port: u16,

    /// Override the port-mapping port (0 derives it from the secondary)
    #[clap(long, default_value_t = 0)]
    pub mapping_port: u16,

    /// Don't cache network configs under networks.d
    #[clap(long)]
    pub no_network_caching: bool,

    /// Don't cache peer state under peers.d
    #[clap(long)]
    pub no_peer_caching: bool,

    /// Ignore local.conf even if present
    #[clap(long)]
    pub no_local_conf: bool,

    /// Don't allocate a mapping port or consult the port mapper
    #[clap(long)]
    pub no_port_mapping: bool,

    /// Multipath link-aggregation mode
    #[clap(long, value_enum, default_value_t = MultipathMode::Disabled)]
    pub multipath: MultipathMode,

    /// Additional interface name prefixes the binder must never use
    #[clap(long)]
    pub interface_prefix_blacklist: Vec<String>,

    /// Bind exactly these endpoints instead of scanning local interfaces
    #[clap(long)]
    pub bind: Vec<SocketAddr>,

    /// Worker threads draining the inbound packet queue
    #[clap(long, default_value_t = 2)]
    pub packet_workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            primary_port: 0,
            secondary_port: 0,
            mapping_port: 0,
            no_network_caching: false,
            no_peer_caching: false,
            no_local_conf: false,
            no_port_mapping: false,
            multipath: MultipathMode::Disabled,
            interface_prefix_blacklist: Vec::new(),
            bind: Vec::new(),
            packet_workers: 2,
        }
    }
}

impl ServiceConfig {
    pub fn allow_network_caching(&self) -> bool {
        !self.no_network_caching
    }

    pub fn allow_peer_caching(&self) -> bool {
        !self.no_peer_caching
    }

    pub fn allow_local_conf(&self) -> bool {
        !self.no_local_conf
    }

    pub fn port_mapping(&self) -> bool {
        !self.no_port_mapping
    }
}

/// Operator overrides for a single peer: preferred contact endpoints and
/// physical address space the engine must never use to reach it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct PeerLocalConfig {
    pub address: PeerAddr,

    /// Endpoints to try when the engine asks for a hint for this peer.
    #[serde(default, rename = "try")]
    pub try_endpoints: Vec<SocketAddr>,

    #[serde(default)]
    pub blacklist: Vec<IpNet>,
}

/// Per-network policy override carried in local.conf.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkLocalConfig {
    pub id: NetworkId,

    #[serde(flatten)]
    pub settings: NetworkSettings,
}

/// The optional `local.conf` file in the home directory. Everything in it
/// defaults to empty so a partial file is fine.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct LocalConfig {
    /// Interface name prefixes the binder must never use, in addition to
    /// the built-in set.
    pub interface_prefix_blacklist: Vec<String>,

    /// Physical v4 space never bound to and never used as a peer path.
    pub blacklist_v4: Vec<Ipv4Net>,

    /// Physical v6 space never bound to and never used as a peer path.
    pub blacklist_v6: Vec<Ipv6Net>,

    /// Sources allowed to manage this node, for front-ends that expose a
    /// management surface.
    pub allowed_management: Vec<IpNet>,

    /// Bind exactly these endpoints instead of scanning local interfaces.
    pub bind: Vec<SocketAddr>,

    #[serde(rename = "peer")]
    pub peers: Vec<PeerLocalConfig>,

    #[serde(rename = "network")]
    pub networks: Vec<NetworkLocalConfig>,
}

impl LocalConfig {
    pub const FILE_NAME: &'static str = "local.conf";

    /// Loads `local.conf` from the home directory; a missing file yields the
    /// defaults, a malformed one is an error.
    pub fn load(home: &Path) -> Result<Self, Error> {
        let path = home.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).with_path(&path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_local_conf_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = LocalConfig::load(dir.path()).unwrap();
        assert_eq!(config, LocalConfig::default());
    }

    #[test]
    fn test_local_conf_parses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(LocalConfig::FILE_NAME),
            r#"
                interface-prefix-blacklist = ["docker", "veth"]
                blacklist-v4 = ["192.168.100.0/24"]

                [[peer]]
                address = "89e92ceee5"
                try = ["203.0.113.10:9413"]
                blacklist = ["10.10.0.0/16"]

                [[network]]
                id = "8056c2e21c000001"
                allow-global = true
            "#,
        )
        .unwrap();

        let config = LocalConfig::load(dir.path()).unwrap();
        assert_eq!(config.interface_prefix_blacklist, vec!["docker", "veth"]);
        assert_eq!(config.blacklist_v4, vec!["192.168.100.0/24".parse::<Ipv4Net>().unwrap()]);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].address, PeerAddr(0x89e92ceee5));
        assert_eq!(config.peers[0].try_endpoints, vec!["203.0.113.10:9413".parse().unwrap()]);
        assert_eq!(config.networks.len(), 1);
        assert!(config.networks[0].settings.allow_global);
        assert!(config.networks[0].settings.allow_managed);
    }

    #[test]
    fn test_malformed_local_conf_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LocalConfig::FILE_NAME), "不 = [malformed").unwrap();
        assert!(LocalConfig::load(dir.path()).is_err());
    }
}
