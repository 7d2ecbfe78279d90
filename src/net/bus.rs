//! The broadcast bus the gossip layer runs over.
//!
//! Only the seam is defined here: a real TCP mesh, a simulator, or the
//! in-process [`MemoryBus`] all look the same to [`NetTangle`]. Delivery is
//! best effort; nothing here guarantees ordering, uniqueness, or arrival.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use super::gossip::NetTangle;
use super::protocol::Message;

/// An opaque transport-assigned peer identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 16]);

impl PeerId {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        PeerId(rand::random())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Best-effort typed message delivery to connected peers.
pub trait Bus: Send + Sync {
    /// Deliver to every connected peer (not to the sender).
    fn broadcast(&self, msg: Message);
    /// Deliver to one peer.
    fn send_to(&self, peer: &PeerId, msg: Message);
    /// The peers currently connected.
    fn peers(&self) -> Vec<PeerId>;
}

/// An in-process bus hub: every attached [`NetTangle`] sees the others as
/// remote peers, with synchronous delivery. Used by tests, simulations, and
/// the self-dispatch path of tangle loading.
pub struct MemoryBus {
    me: Weak<MemoryBus>,
    endpoints: Mutex<HashMap<PeerId, Weak<NetTangle>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<MemoryBus> {
        Arc::new_cyclic(|me| MemoryBus {
            me: me.clone(),
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Register an endpoint and fire connect notifications both ways.
    pub fn attach(&self, net: &Arc<NetTangle>) {
        let existing: Vec<(PeerId, Weak<NetTangle>)> = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            let existing = endpoints
                .iter()
                .map(|(id, ep)| (*id, ep.clone()))
                .collect();
            endpoints.insert(net.self_id(), Arc::downgrade(net));
            existing
        };
        for (peer, endpoint) in existing {
            net.handle_connect(peer);
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.handle_connect(net.self_id());
            }
        }
    }

    /// Deregister an endpoint and fire disconnect notifications.
    pub fn detach(&self, peer: &PeerId) {
        let remaining: Vec<Weak<NetTangle>> = {
            let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
            endpoints.remove(peer);
            endpoints.values().cloned().collect()
        };
        for endpoint in remaining {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.handle_disconnect(*peer);
            }
        }
    }

    /// A [`Bus`] view for one endpoint.
    pub fn handle(&self, self_id: PeerId) -> Arc<MemoryBusHandle> {
        Arc::new(MemoryBusHandle {
            hub: self.me.upgrade().expect("hub is alive while handles exist"),
            self_id,
        })
    }

    fn targets(&self, exclude: Option<&PeerId>) -> Vec<Weak<NetTangle>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .map(|(_, ep)| ep.clone())
            .collect()
    }

    fn target(&self, peer: &PeerId) -> Option<Weak<NetTangle>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }
}

/// One endpoint's view of a [`MemoryBus`].
pub struct MemoryBusHandle {
    hub: Arc<MemoryBus>,
    self_id: PeerId,
}

impl Bus for MemoryBusHandle {
    fn broadcast(&self, msg: Message) {
        // Snapshot targets before delivering: a handler may broadcast in
        // turn, and holding the registry lock across delivery would deadlock.
        for endpoint in self.hub.targets(Some(&self.self_id)) {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.handle_message(self.self_id, msg.clone());
            }
        }
    }

    fn send_to(&self, peer: &PeerId, msg: Message) {
        if let Some(endpoint) = self.hub.target(peer).and_then(|ep| ep.upgrade()) {
            endpoint.handle_message(self.self_id, msg);
        }
    }

    fn peers(&self) -> Vec<PeerId> {
        self.hub
            .endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|id| **id != self.self_id)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_display_is_hex() {
        let id = PeerId([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn random_peer_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
