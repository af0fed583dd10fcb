//! State-change events delivered to the embedder.
//!
//! Events are posted to a single queue and drained by the external consumer;
//! delivery is FIFO per producer. The `code()` strings are stable API — they
//! are what wire and binding consumers match on.

use crossbeam_channel::Sender;
use ipnet::{Ipv4Net, Ipv6Net};
use std::fmt;
use tapmesh_shared::{NetworkId, PeerAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NodeUp,
    NodeOnline,
    NodeOffline,
    NodeDown,
    NodeNormalTermination,
    NodeUnrecoverableError { message: String },
    NodeIdentityCollision,
    NetworkNotFound { nwid: NetworkId },
    NetworkClientTooOld { nwid: NetworkId },
    NetworkReqConfig { nwid: NetworkId },
    NetworkOk { nwid: NetworkId },
    NetworkAccessDenied { nwid: NetworkId },
    NetworkReadyIp4 { nwid: NetworkId },
    NetworkReadyIp6 { nwid: NetworkId },
    NetworkUpdate { nwid: NetworkId },
    AddrAddedIp4 { nwid: NetworkId, addr: Ipv4Net },
    AddrAddedIp6 { nwid: NetworkId, addr: Ipv6Net },
    AddrRemovedIp4 { nwid: NetworkId, addr: Ipv4Net },
    AddrRemovedIp6 { nwid: NetworkId, addr: Ipv6Net },
    PeerDirect { peer: PeerAddr },
    PeerRelay { peer: PeerAddr },
    PeerPathDiscovered { peer: PeerAddr },
    PeerPathDead { peer: PeerAddr },
}

impl Event {
    /// The stable wire/API name of this event.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeUp => "NODE_UP",
            Self::NodeOnline => "NODE_ONLINE",
            Self::NodeOffline => "NODE_OFFLINE",
            Self::NodeDown => "NODE_DOWN",
            Self::NodeNormalTermination => "NODE_NORMAL_TERMINATION",
            Self::NodeUnrecoverableError { .. } => "NODE_UNRECOVERABLE_ERROR",
            Self::NodeIdentityCollision => "NODE_IDENTITY_COLLISION",
            Self::NetworkNotFound { .. } => "NETWORK_NOT_FOUND",
            Self::NetworkClientTooOld { .. } => "NETWORK_CLIENT_TOO_OLD",
            Self::NetworkReqConfig { .. } => "NETWORK_REQ_CONFIG",
            Self::NetworkOk { .. } => "NETWORK_OK",
            Self::NetworkAccessDenied { .. } => "NETWORK_ACCESS_DENIED",
            Self::NetworkReadyIp4 { .. } => "NETWORK_READY_IP4",
            Self::NetworkReadyIp6 { .. } => "NETWORK_READY_IP6",
            Self::NetworkUpdate { .. } => "NETWORK_UPDATE",
            Self::AddrAddedIp4 { .. } => "ADDR_ADDED_IP4",
            Self::AddrAddedIp6 { .. } => "ADDR_ADDED_IP6",
            Self::AddrRemovedIp4 { .. } => "ADDR_REMOVED_IP4",
            Self::AddrRemovedIp6 { .. } => "ADDR_REMOVED_IP6",
            Self::PeerDirect { .. } => "PEER_DIRECT",
            Self::PeerRelay { .. } => "PEER_RELAY",
            Self::PeerPathDiscovered { .. } => "PEER_PATH_DISCOVERED",
            Self::PeerPathDead { .. } => "PEER_PATH_DEAD",
        }
    }

    /// The network this event concerns, if it is network-scoped.
    pub fn nwid(&self) -> Option<NetworkId> {
        match self {
            Self::NetworkNotFound { nwid }
            | Self::NetworkClientTooOld { nwid }
            | Self::NetworkReqConfig { nwid }
            | Self::NetworkOk { nwid }
            | Self::NetworkAccessDenied { nwid }
            | Self::NetworkReadyIp4 { nwid }
            | Self::NetworkReadyIp6 { nwid }
            | Self::NetworkUpdate { nwid }
            | Self::AddrAddedIp4 { nwid, .. }
            | Self::AddrAddedIp6 { nwid, .. }
            | Self::AddrRemovedIp4 { nwid, .. }
            | Self::AddrRemovedIp6 { nwid, .. } => Some(*nwid),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())?;
        match self {
            Self::NodeUnrecoverableError { message } => write!(f, " ({message})"),
            Self::AddrAddedIp4 { nwid, addr } | Self::AddrRemovedIp4 { nwid, addr } => {
                write!(f, " ({nwid} {addr})")
            },
            Self::AddrAddedIp6 { nwid, addr } | Self::AddrRemovedIp6 { nwid, addr } => {
                write!(f, " ({nwid} {addr})")
            },
            Self::PeerDirect { peer }
            | Self::PeerRelay { peer }
            | Self::PeerPathDiscovered { peer }
            | Self::PeerPathDead { peer } => write!(f, " ({peer})"),
            other => match other.nwid() {
                Some(nwid) => write!(f, " ({nwid})"),
                None => Ok(()),
            },
        }
    }
}

/// The producer side of the event queue. Cheap to clone; emission never
/// blocks and silently stops once the consumer goes away.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        log::debug!("event {event}");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let nwid = NetworkId(0x8056c2e21c000001);
        assert_eq!(Event::NodeUp.code(), "NODE_UP");
        assert_eq!(Event::NetworkReqConfig { nwid }.code(), "NETWORK_REQ_CONFIG");
        assert_eq!(
            Event::AddrAddedIp4 {
                nwid,
                addr: "10.147.20.5/24".parse().unwrap()
            }
            .code(),
            "ADDR_ADDED_IP4"
        );
        assert_eq!(
            Event::PeerPathDiscovered {
                peer: PeerAddr(0x89e92ceee5)
            }
            .code(),
            "PEER_PATH_DISCOVERED"
        );
    }

    #[test]
    fn test_display_carries_payload() {
        let event = Event::AddrAddedIp4 {
            nwid: NetworkId(0x8056c2e21c000001),
            addr: "10.147.20.5/24".parse().unwrap(),
        };
        assert_eq!(
            event.to_string(),
            "ADDR_ADDED_IP4 (8056c2e21c000001 10.147.20.5/24)"
        );
    }
}
