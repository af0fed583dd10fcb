use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ops::Deref,
    path::Path,
    str::FromStr,
};

/// A 64-bit virtual network identifier, conventionally written as 16 hex
/// digits (e.g. `8056c2e21c000001`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetworkId(pub u64);

impl Display for NetworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 {
            return Err("network IDs are exactly 16 hex digits");
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| "invalid hex in network ID")
    }
}

impl Serialize for NetworkId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetworkId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A 40-bit overlay peer address, conventionally written as 10 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerAddr(pub u64);

impl PeerAddr {
    pub const MAX: u64 = (1 << 40) - 1;
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:010x}", self.0)
    }
}

impl FromStr for PeerAddr {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 10 {
            return Err("peer addresses are exactly 10 hex digits");
        }
        let raw = u64::from_str_radix(s, 16).map_err(|_| "invalid hex in peer address")?;
        if raw > Self::MAX {
            return Err("peer address out of 40-bit range");
        }
        Ok(Self(raw))
    }
}

impl Serialize for PeerAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Coarse reachability classification of an IP address, used by the managed
/// address policy and the packet plane's "last global receive" bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpScope {
    None,
    Multicast,
    Loopback,
    LinkLocal,
    Private,
    Shared,
    Global,
}

pub fn scope_of(addr: IpAddr) -> IpScope {
    match addr {
        IpAddr::V4(v4) => scope_of_v4(v4),
        IpAddr::V6(v6) => scope_of_v6(v6),
    }
}

fn scope_of_v4(ip: Ipv4Addr) -> IpScope {
    let octets = ip.octets();
    if ip.is_unspecified() || ip.is_broadcast() || octets[0] >= 240 {
        IpScope::None
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_link_local() {
        IpScope::LinkLocal
    } else if ip.is_private() {
        IpScope::Private
    } else if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
        // 100.64.0.0/10, carrier-grade NAT.
        IpScope::Shared
    } else {
        IpScope::Global
    }
}

fn scope_of_v6(ip: Ipv6Addr) -> IpScope {
    let segments = ip.segments();
    if ip.is_unspecified() || (segments[0] == 0x2001 && segments[1] == 0xdb8) {
        IpScope::None
    } else if ip.is_multicast() {
        IpScope::Multicast
    } else if ip.is_loopback() {
        IpScope::Loopback
    } else if (segments[0] & 0xffc0) == 0xfe80 {
        IpScope::LinkLocal
    } else if (segments[0] & 0xfe00) == 0xfc00 {
        // Unique local addresses behave like RFC 1918 space.
        IpScope::Private
    } else {
        IpScope::Global
    }
}

/// A route assigned by a network controller. `via` is `None` for on-link
/// routes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ManagedRoute {
    pub target: IpNet,
    pub via: Option<IpAddr>,
}

impl Display for ManagedRoute {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.via {
            Some(via) => write!(f, "{} via {}", self.target, via),
            None => write!(f, "{} on-link", self.target),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-network policy controlling which controller-assigned addresses and
/// routes are actually installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkSettings {
    /// Install controller-assigned addresses and routes at all.
    #[serde(default = "default_true")]
    pub allow_managed: bool,

    /// Permit assignments with global scope (the controller can direct
    /// traffic for public address space through the overlay).
    pub allow_global: bool,

    /// Permit a default-route (0.0.0.0/0 or ::/0) assignment.
    pub allow_default: bool,

    /// When non-empty, only assignments contained in one of these prefixes
    /// are installed.
    pub allow_managed_whitelist: Vec<IpNet>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            allow_managed: true,
            allow_global: false,
            allow_default: false,
            allow_managed_whitelist: Vec::new(),
        }
    }
}

pub trait IoErrorContext<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError>;
    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError> {
        self.with_str(path.as_ref().to_string_lossy())
    }

    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError> {
        self.map_err(|e| WrappedIoError {
            io_error: e,
            context: context.into(),
        })
    }
}

#[derive(Debug)]
pub struct WrappedIoError {
    io_error: std::io::Error,
    context: String,
}

impl Display for WrappedIoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{} - {}", self.context, self.io_error)
    }
}

impl Deref for WrappedIoError {
    type Target = std::io::Error;

    fn deref(&self) -> &Self::Target {
        &self.io_error
    }
}

impl std::error::Error for WrappedIoError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_id_roundtrip() {
        let id: NetworkId = "8056c2e21c000001".parse().unwrap();
        assert_eq!(id, NetworkId(0x8056c2e21c000001));
        assert_eq!(id.to_string(), "8056c2e21c000001");
    }

    #[test]
    fn test_network_id_rejects_bad_input() {
        assert!("8056c2e21c00000".parse::<NetworkId>().is_err());
        assert!("8056c2e21c0000011".parse::<NetworkId>().is_err());
        assert!("8056c2e21c00000g".parse::<NetworkId>().is_err());
    }

    #[test]
    fn test_peer_addr_roundtrip() {
        let addr: PeerAddr = "89e92ceee5".parse().unwrap();
        assert_eq!(addr, PeerAddr(0x89e92ceee5));
        assert_eq!(addr.to_string(), "89e92ceee5");
        assert!("z9e92ceee5".parse::<PeerAddr>().is_err());
        assert!("89e92cee".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_v4_scopes() {
        let cases: &[(&str, IpScope)] = &[
            ("0.0.0.0", IpScope::None),
            ("255.255.255.255", IpScope::None),
            ("240.1.2.3", IpScope::None),
            ("224.0.0.1", IpScope::Multicast),
            ("127.0.0.1", IpScope::Loopback),
            ("169.254.10.1", IpScope::LinkLocal),
            ("10.147.20.5", IpScope::Private),
            ("172.16.0.1", IpScope::Private),
            ("192.168.1.1", IpScope::Private),
            ("100.64.0.1", IpScope::Shared),
            ("100.127.255.254", IpScope::Shared),
            ("100.128.0.1", IpScope::Global),
            ("8.8.8.8", IpScope::Global),
        ];
        for (addr, scope) in cases {
            assert_eq!(scope_of(addr.parse().unwrap()), *scope, "addr {addr}");
        }
    }

    #[test]
    fn test_v6_scopes() {
        let cases: &[(&str, IpScope)] = &[
            ("::", IpScope::None),
            ("2001:db8::1", IpScope::None),
            ("ff02::1", IpScope::Multicast),
            ("::1", IpScope::Loopback),
            ("fe80::1234", IpScope::LinkLocal),
            ("fd00::1", IpScope::Private),
            ("2607:f8b0::1", IpScope::Global),
        ];
        for (addr, scope) in cases {
            assert_eq!(scope_of(addr.parse().unwrap()), *scope, "addr {addr}");
        }
    }

    #[test]
    fn test_network_settings_default() {
        let settings = NetworkSettings::default();
        assert!(settings.allow_managed);
        assert!(!settings.allow_global);
        assert!(!settings.allow_default);
        assert!(settings.allow_managed_whitelist.is_empty());
    }
}
