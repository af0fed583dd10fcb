//! UDP port selection via trial binding.
//!
//! The service uses up to three ports: the primary (user-chosen or random),
//! a secondary derived from the node's overlay address (helps NATs that
//! punish port reuse), and a mapping port handed to the port mapper. A port
//! qualifies only if both UDP and a TCP listener can bind it on at least
//! one address family.

use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use tapmesh_shared::PeerAddr;

pub(crate) const PORT_RANGE_START: u16 = 20000;
pub(crate) const PORT_RANGE_END: u16 = 65500;
const PORT_RANGE_SPAN: u64 = (PORT_RANGE_END - PORT_RANGE_START) as u64;

const PRIMARY_ATTEMPTS: usize = 256;
const DERIVED_ATTEMPTS: usize = 1000;

/// The service's UDP port array. `primary` is nonzero after successful
/// initialization; `secondary` and `mapping` are zero if allocation failed
/// or is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ports {
    pub primary: u16,
    pub secondary: u16,
    pub mapping: u16,
}

impl Ports {
    /// The distinct nonzero ports, primary first.
    pub fn nonzero(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(3);
        for port in [self.primary, self.secondary, self.mapping] {
            if port != 0 && !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }
}

/// Returns true iff `port` could be bound for both UDP and a TCP listener
/// on at least one of v4/v6. All probe sockets are closed before returning.
pub fn trial_bind(port: u16) -> bool {
    trial_bind_on(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        || trial_bind_on(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
}

fn trial_bind_on(ip: IpAddr, port: u16) -> bool {
    let addr = SocketAddr::new(ip, port);
    let _udp = match UdpSocket::bind(addr) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    TcpListener::bind(addr).is_ok()
}

/// Picks the primary port: a configured port is tried once, port 0 draws
/// random candidates from the dynamic range until one binds.
pub(crate) fn select_primary(configured: u16) -> Option<u16> {
    if configured != 0 {
        return trial_bind(configured).then_some(configured);
    }
    let mut rng = rand::thread_rng();
    for _ in 0..PRIMARY_ATTEMPTS {
        let port = rng.gen_range(PORT_RANGE_START..PORT_RANGE_END);
        if trial_bind(port) {
            return Some(port);
        }
    }
    None
}

/// The address-derived starting point for the secondary port.
pub(crate) fn derived_start(addr: PeerAddr) -> u16 {
    PORT_RANGE_START + (addr.0 % PORT_RANGE_SPAN) as u16
}

/// Probes ports starting at `start`, incrementing (and wrapping back to the
/// range start past 65535) until one binds. Returns 0 when the attempt
/// budget is exhausted.
pub(crate) fn select_derived(start: u16) -> u16 {
    let mut port = if start == 0 { PORT_RANGE_START } else { start };
    for _ in 0..DERIVED_ATTEMPTS {
        if trial_bind(port) {
            return port;
        }
        port = port.checked_add(1).unwrap_or(PORT_RANGE_START);
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Occupies UDP on both families so `trial_bind` has nothing to grab.
    struct Occupied {
        _v4: UdpSocket,
        _v6: Option<UdpSocket>,
        port: u16,
    }

    fn occupy_some_port() -> Occupied {
        let v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = v4.local_addr().unwrap().port();
        let v6 = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, port)).ok();
        Occupied { _v4: v4, _v6: v6, port }
    }

    #[test]
    fn test_trial_bind_free_port() {
        let port = {
            let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
            probe.local_addr().unwrap().port()
        };
        assert!(trial_bind(port));
    }

    #[test]
    fn test_trial_bind_occupied_port() {
        let occupied = occupy_some_port();
        if occupied._v6.is_some() {
            assert!(!trial_bind(occupied.port));
        }
    }

    #[test]
    fn test_primary_random_stays_in_range() {
        let port = select_primary(0).expect("a random port should bind");
        assert!((PORT_RANGE_START..PORT_RANGE_END).contains(&port));
    }

    #[test]
    fn test_primary_configured_but_taken() {
        let occupied = occupy_some_port();
        if occupied._v6.is_some() {
            assert_eq!(select_primary(occupied.port), None);
        }
    }

    #[test]
    fn test_derived_start_is_stable_and_in_range() {
        let start = derived_start(PeerAddr(0x89e92ceee5));
        assert_eq!(start, derived_start(PeerAddr(0x89e92ceee5)));
        assert!((PORT_RANGE_START..PORT_RANGE_END).contains(&start));
    }

    #[test]
    fn test_derived_probe_walks_forward() {
        let occupied = occupy_some_port();
        if occupied._v6.is_some() {
            let selected = select_derived(occupied.port);
            assert_ne!(selected, occupied.port);
            assert_ne!(selected, 0);
        }
    }

    #[test]
    fn test_ports_nonzero_deduplicates() {
        let ports = Ports {
            primary: 9413,
            secondary: 21000,
            mapping: 21000,
        };
        assert_eq!(ports.nonzero(), vec![9413, 21000]);

        let ports = Ports {
            primary: 9413,
            secondary: 0,
            mapping: 0,
        };
        assert_eq!(ports.nonzero(), vec![9413]);
    }
}
