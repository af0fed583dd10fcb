//! The set of bound UDP endpoints.
//!
//! The binder periodically reconciles its sockets against the current local
//! interface addresses (or an explicit bind list), filtered through
//! [`should_bind_interface`]. Each socket gets a dedicated receive thread
//! feeding the packet plane; sockets for addresses that disappeared are
//! retired by flipping their liveness flag and letting the thread drain out
//! on its read timeout.

use crate::engine::SocketId;
use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use std::{
    net::{IpAddr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tapmesh_shared::{local_interface_addrs, LocalInterfaceAddr};

/// Interface name prefixes that are never used for outbound binding:
/// loopbacks, our own taps, and other overlays' virtual devices (binding
/// those would loop overlay traffic back over the overlay).
const DEFAULT_PREFIX_BLACKLIST: &[&str] = &["lo", "zt", "tun", "tap", "feth", "utun"];

pub(crate) const RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// Decides whether a local (interface, address) pair may carry overlay
/// traffic. `tap_addrs` is the set of addresses currently installed on our
/// own taps.
pub(crate) fn should_bind_interface(
    name: &str,
    addr: IpAddr,
    user_prefixes: &[String],
    blacklist_v4: &[Ipv4Net],
    blacklist_v6: &[Ipv6Net],
    tap_addrs: &[IpAddr],
) -> bool {
    if DEFAULT_PREFIX_BLACKLIST
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        return false;
    }
    if user_prefixes.iter().any(|prefix| name.starts_with(prefix)) {
        return false;
    }
    match addr {
        IpAddr::V4(v4) => {
            if blacklist_v4.iter().any(|net| net.contains(&v4)) {
                return false;
            }
        },
        IpAddr::V6(v6) => {
            if blacklist_v6.iter().any(|net| net.contains(&v6)) {
                return false;
            }
        },
    }
    if tap_addrs.contains(&addr) {
        return false;
    }
    true
}

pub(crate) struct BoundSocket {
    pub id: SocketId,
    pub sock: UdpSocket,
    pub local: SocketAddr,
    pub interface: String,
    pub live: AtomicBool,
}

impl BoundSocket {
    /// Sends a datagram, honoring the per-packet TTL hint on v4. The
    /// socket TTL is restored to 255 afterwards so the hint never leaks
    /// into unrelated sends.
    pub fn send_with_ttl(&self, dest: SocketAddr, data: &[u8], ttl: u8) -> bool {
        if self.local.is_ipv4() != dest.is_ipv4() {
            return false;
        }
        let limit_ttl = dest.is_ipv4() && ttl > 0;
        if limit_ttl {
            if let Err(e) = self.sock.set_ttl(u32::from(ttl)) {
                log::debug!("cannot set TTL {ttl} on {}: {}", self.local, e);
            }
        }
        let sent = self.sock.send_to(data, dest).is_ok();
        if limit_ttl {
            let _ = self.sock.set_ttl(255);
        }
        sent
    }
}

pub(crate) struct Binder {
    sockets: Mutex<Vec<Arc<BoundSocket>>>,
    next_id: AtomicU32,
}

impl Binder {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Reconciles bound sockets against the desired endpoint set: the
    /// explicit bind list if present, otherwise every eligible interface
    /// address crossed with `ports`. `on_bound` is invoked for each freshly
    /// bound socket so the caller can attach a receive thread.
    pub fn refresh(
        &self,
        ports: &[u16],
        explicit: &[SocketAddr],
        filter: impl Fn(&str, IpAddr) -> bool,
        mut on_bound: impl FnMut(Arc<BoundSocket>),
    ) {
        let desired: Vec<(String, SocketAddr)> = if !explicit.is_empty() {
            explicit
                .iter()
                .map(|addr| (String::new(), *addr))
                .collect()
        } else {
            let candidates = match local_interface_addrs() {
                Ok(candidates) => candidates,
                Err(e) => {
                    log::warn!("cannot enumerate local interfaces: {}", e);
                    return;
                },
            };
            candidates
                .into_iter()
                .filter(|LocalInterfaceAddr { name, addr }| filter(name, *addr))
                .flat_map(|LocalInterfaceAddr { name, addr }| {
                    ports
                        .iter()
                        .map(move |port| (name.clone(), SocketAddr::new(addr, *port)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut sockets = self.sockets.lock();

        sockets.retain(|socket| {
            let keep = desired.iter().any(|(_, addr)| *addr == socket.local);
            if !keep {
                log::debug!("unbinding {} ({})", socket.local, socket.interface);
                socket.live.store(false, Ordering::Relaxed);
            }
            keep
        });

        for (interface, addr) in desired {
            if sockets.iter().any(|socket| socket.local == addr) {
                continue;
            }
            let sock = match UdpSocket::bind(addr) {
                Ok(sock) => sock,
                Err(e) => {
                    log::debug!("cannot bind {addr}: {e}");
                    continue;
                },
            };
            if let Err(e) = sock.set_read_timeout(Some(RECV_TIMEOUT)) {
                log::warn!("cannot set read timeout on {addr}: {e}");
                continue;
            }
            let socket = Arc::new(BoundSocket {
                id: SocketId(self.next_id.fetch_add(1, Ordering::Relaxed)),
                sock,
                local: addr,
                interface: interface.clone(),
                live: AtomicBool::new(true),
            });
            log::debug!(
                "bound {addr} on {}",
                if interface.is_empty() { "<explicit>" } else { interface.as_str() }
            );
            sockets.push(socket.clone());
            on_bound(socket);
        }
    }

    pub fn socket_by_id(&self, id: SocketId) -> Option<Arc<BoundSocket>> {
        self.sockets
            .lock()
            .iter()
            .find(|socket| socket.id == id)
            .cloned()
    }

    /// The local addresses of all currently bound sockets.
    pub fn bound_locals(&self) -> Vec<SocketAddr> {
        self.sockets.lock().iter().map(|s| s.local).collect()
    }

    /// Sends on every bound socket of the destination's family; true if at
    /// least one send succeeded.
    pub fn send_all(&self, dest: SocketAddr, data: &[u8], ttl: u8) -> bool {
        let sockets = self.sockets.lock().clone();
        let mut sent = false;
        for socket in sockets {
            sent |= socket.send_with_ttl(dest, data, ttl);
        }
        sent
    }

    /// Retires every socket; their receive threads drain out on the next
    /// read timeout.
    pub fn close_all(&self) {
        let mut sockets = self.sockets.lock();
        for socket in sockets.drain(..) {
            socket.live.store(false, Ordering::Relaxed);
        }
    }
}
