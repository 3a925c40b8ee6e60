//! Relay slot accounting for a tunneler (§4.8): how many NAT-bound peers this node is
//! currently relaying for, bounded by its configured `max_tunnels`.

use std::collections::HashMap;

use storj_crypto::NodeId;
use storj_rpc::Contact;
use tokio::sync::Mutex;

/// Tracks outstanding OPEN_TUNNEL grants against a capacity. A node that should never
/// relay for others (a tunnel-client, per §4.8: "A tunnel-client node sets its own
/// max-tunnels to 0") is modeled simply by constructing this with `max_tunnels: 0`, at
/// which point [`Self::allocate`] always returns `None`.
pub struct RelaySlots {
    max_tunnels: u32,
    own_contact: Contact,
    granted: Mutex<HashMap<NodeId, u32>>,
    next_slot: Mutex<u32>,
}

impl RelaySlots {
    pub fn new(max_tunnels: u32, own_contact: Contact) -> Self {
        Self { max_tunnels, own_contact, granted: Mutex::new(HashMap::new()), next_slot: Mutex::new(0) }
    }

    /// Grants `requester` a relay slot if capacity remains, returning the relay's
    /// websocket URL and the alias contact the requester should advertise from then on
    /// (§4.8: "Its advertised contact is then the tunnel's alias"). Re-requesting while
    /// already holding a slot returns the same grant rather than consuming a second one.
    pub async fn allocate(&self, requester: NodeId) -> Option<(String, Contact)> {
        let mut granted = self.granted.lock().await;
        if let Some(&slot) = granted.get(&requester) {
            return Some(self.grant_for(requester, slot));
        }
        if self.max_tunnels == 0 || granted.len() as u32 >= self.max_tunnels {
            return None;
        }
        let mut next_slot = self.next_slot.lock().await;
        let slot = *next_slot;
        *next_slot += 1;
        granted.insert(requester, slot);
        Some(self.grant_for(requester, slot))
    }

    fn grant_for(&self, requester: NodeId, slot: u32) -> (String, Contact) {
        let tunnel_url = format!("ws://{}:{}/tunnels/{}", self.own_contact.address, self.own_contact.port, slot);
        let alias = Contact {
            address: self.own_contact.address.clone(),
            port: self.own_contact.port.wrapping_add(1).wrapping_add(slot as u16),
            node_id: requester,
            protocol_version: self.own_contact.protocol_version.clone(),
            last_seen: 0,
        };
        (tunnel_url, alias)
    }

    pub async fn release(&self, requester: NodeId) {
        self.granted.lock().await.remove(&requester);
    }

    pub async fn available_slots(&self) -> u32 {
        self.max_tunnels.saturating_sub(self.granted.lock().await.len() as u32)
    }

    pub fn max_tunnels(&self) -> u32 {
        self.max_tunnels
    }
}

#[cfg(test)]
mod tests {
    use storj_crypto::{KeyPair, ProtocolVersion};

    use super::*;

    fn own() -> Contact {
        Contact::new("203.0.113.1", 4000, KeyPair::generate().node_id(), ProtocolVersion::new(1, 0, 0, None))
    }

    #[tokio::test]
    async fn re_requesting_the_same_slot_does_not_consume_capacity_twice() {
        let slots = RelaySlots::new(1, own());
        let requester = KeyPair::generate().node_id();
        let (_, alias_a) = slots.allocate(requester).await.unwrap();
        let (_, alias_b) = slots.allocate(requester).await.unwrap();
        assert_eq!(alias_a.port, alias_b.port);
    }

    #[tokio::test]
    async fn a_client_with_zero_max_tunnels_never_grants() {
        let slots = RelaySlots::new(0, own());
        assert!(slots.allocate(KeyPair::generate().node_id()).await.is_none());
    }

    #[tokio::test]
    async fn releasing_frees_capacity_for_another_requester() {
        let slots = RelaySlots::new(1, own());
        let a = KeyPair::generate().node_id();
        let b = KeyPair::generate().node_id();
        slots.allocate(a).await.unwrap();
        assert!(slots.allocate(b).await.is_none());
        slots.release(a).await;
        assert!(slots.allocate(b).await.is_some());
    }
}
