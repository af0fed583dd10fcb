//! Edge-triggered peer connectivity events.
//!
//! Each tick the service compares the engine's peer snapshot against the
//! last observed direct-path count per peer and emits at most one event per
//! peer. The rules are evaluated first-match:
//!
//! 1. unseen peer with direct paths        -> PEER_DIRECT
//! 2. unseen peer without direct paths     -> PEER_RELAY
//! 3. path count grew                      -> PEER_PATH_DISCOVERED
//! 4. path count shrank                    -> PEER_PATH_DEAD
//!
//! An unchanged count emits nothing.

use crate::engine::PeerView;
use crate::events::Event;
use std::collections::HashMap;
use tapmesh_shared::PeerAddr;

#[derive(Default)]
pub(crate) struct PeerDeltaDetector {
    cache: HashMap<PeerAddr, usize>,
}

impl PeerDeltaDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one peer snapshot and returns the events it implies, in
    /// snapshot order.
    pub fn observe(&mut self, peers: &[PeerView]) -> Vec<Event> {
        let mut events = Vec::new();
        for peer in peers {
            let event = match self.cache.get(&peer.addr) {
                None if peer.direct_paths > 0 => Some(Event::PeerDirect { peer: peer.addr }),
                None => Some(Event::PeerRelay { peer: peer.addr }),
                Some(&previous) if previous < peer.direct_paths => {
                    Some(Event::PeerPathDiscovered { peer: peer.addr })
                },
                Some(&previous) if previous > peer.direct_paths => {
                    Some(Event::PeerPathDead { peer: peer.addr })
                },
                Some(_) => None,
            };
            events.extend(event);
            self.cache.insert(peer.addr, peer.direct_paths);
        }
        events
    }
}
