//! The Kademlia-style routing table (§4.9, §5): contacts bucketed by XOR distance
//! from this node's own id, each bucket guarded by its own lock so inserts into one
//! bucket never block a lookup against another ("updates must be atomic per bucket").
//!
//! Actual peer discovery (`FIND_NODE`/`FIND_VALUE`) is `libp2p::kad`'s job per
//! SPEC_FULL §4.7; this table is the local view the cleaner and reentry timer act on.

use std::sync::Arc;

use storj_crypto::{NodeId, ProtocolVersion};
use storj_rpc::Contact;
use tokio::sync::Mutex;

/// One bit per bucket: bucket `i` holds contacts whose XOR distance from `self_id` has
/// its highest set bit at position `i`, matching the traditional Kademlia k-bucket
/// layout over a 160-bit id space.
const NUM_BUCKETS: usize = storj_crypto::NODE_ID_LEN * 8;

fn bucket_index(self_id: NodeId, other: NodeId) -> usize {
    for byte in 0..storj_crypto::NODE_ID_LEN {
        let xor = self_id.0[byte] ^ other.0[byte];
        if xor != 0 {
            let bit_in_byte = xor.leading_zeros() as usize;
            return NUM_BUCKETS - 1 - (byte * 8 + bit_in_byte);
        }
    }
    0
}

/// A single k-bucket: up to `capacity` contacts, oldest evicted first when full.
struct Bucket {
    capacity: usize,
    contacts: Mutex<Vec<Contact>>,
}

impl Bucket {
    fn new(capacity: usize) -> Self {
        Self { capacity, contacts: Mutex::new(Vec::new()) }
    }
}

/// The node's local routing table.
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, bucket_capacity: usize) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| Bucket::new(bucket_capacity)).collect();
        Self { self_id, buckets }
    }

    /// Inserts or refreshes `contact`. A contact already present is moved to the
    /// bucket's most-recently-seen end; a genuinely new one evicts the oldest entry
    /// once its bucket is full.
    pub async fn insert(&self, contact: Contact) {
        if contact.node_id == self.self_id {
            return;
        }
        let bucket = &self.buckets[bucket_index(self.self_id, contact.node_id)];
        let mut entries = bucket.contacts.lock().await;
        entries.retain(|existing| existing.node_id != contact.node_id);
        if entries.len() >= bucket.capacity {
            entries.remove(0);
        }
        entries.push(contact);
    }

    pub async fn remove(&self, node_id: NodeId) {
        let bucket = &self.buckets[bucket_index(self.self_id, node_id)];
        bucket.contacts.lock().await.retain(|existing| existing.node_id != node_id);
    }

    /// All contacts currently held, across every bucket.
    pub async fn all(&self) -> Vec<Contact> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            out.extend(bucket.contacts.lock().await.iter().cloned());
        }
        out
    }

    pub async fn len(&self) -> usize {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.contacts.lock().await.len();
        }
        total
    }

    /// Up to `count` contacts closest to `target` by XOR distance, the shape
    /// `FIND_NODE` answers need (glue onto `libp2p::kad`, per SPEC_FULL §4.7).
    pub async fn closest(&self, target: NodeId, count: usize) -> Vec<Contact> {
        let mut all = self.all().await;
        all.sort_by_key(|c| xor_distance(target, c.node_id));
        all.truncate(count);
        all
    }

    /// Drops contacts whose protocol is incompatible with `self_version` or whose
    /// address fails [`Contact::is_routable`] (§4.9's cleaner rule). Returns the
    /// removed contacts for logging.
    pub async fn clean(&self, self_version: &ProtocolVersion, allow_loopback: bool) -> Vec<Contact> {
        let mut removed = Vec::new();
        for bucket in &self.buckets {
            let mut entries = bucket.contacts.lock().await;
            let (keep, drop) = entries
                .drain(..)
                .partition(|c| c.protocol_version.is_compatible_with(self_version) && c.is_routable(allow_loopback));
            *entries = keep;
            removed.extend(drop);
        }
        removed
    }
}

fn xor_distance(a: NodeId, b: NodeId) -> [u8; storj_crypto::NODE_ID_LEN] {
    let mut out = [0u8; storj_crypto::NODE_ID_LEN];
    for i in 0..storj_crypto::NODE_ID_LEN {
        out[i] = a.0[i] ^ b.0[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use storj_crypto::KeyPair;

    use super::*;

    fn contact(node_id: NodeId, version: ProtocolVersion) -> Contact {
        Contact::new("198.51.100.10", 4000, node_id, version)
    }

    #[tokio::test]
    async fn a_contact_does_not_route_to_itself() {
        let keys = KeyPair::generate();
        let table = RoutingTable::new(keys.node_id(), 20);
        table.insert(contact(keys.node_id(), ProtocolVersion::new(1, 0, 0, None))).await;
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn inserting_the_same_contact_twice_does_not_duplicate() {
        let self_keys = KeyPair::generate();
        let table = RoutingTable::new(self_keys.node_id(), 20);
        let peer = KeyPair::generate().node_id();
        table.insert(contact(peer, ProtocolVersion::new(1, 0, 0, None))).await;
        table.insert(contact(peer, ProtocolVersion::new(1, 0, 0, None))).await;
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn closest_returns_contacts_sorted_by_xor_distance_to_target() {
        let self_keys = KeyPair::generate();
        let table = RoutingTable::new(self_keys.node_id(), 20);
        let target = NodeId::from_hex(&"00".repeat(20)).unwrap();

        let near = NodeId::from_hex(&format!("{}{}", "00".repeat(19), "01")).unwrap();
        let far = NodeId::from_hex(&"ff".repeat(20)).unwrap();
        table.insert(contact(far, ProtocolVersion::new(1, 0, 0, None))).await;
        table.insert(contact(near, ProtocolVersion::new(1, 0, 0, None))).await;

        let closest = table.closest(target, 1).await;
        assert_eq!(closest[0].node_id, near);
    }

    #[tokio::test]
    async fn cleaning_drops_incompatible_and_unroutable_contacts() {
        let self_keys = KeyPair::generate();
        let self_version = ProtocolVersion::new(1, 0, 0, None);
        let table = RoutingTable::new(self_keys.node_id(), 20);

        let compatible = KeyPair::generate().node_id();
        let incompatible_version = KeyPair::generate().node_id();
        let loopback = KeyPair::generate().node_id();

        table.insert(contact(compatible, ProtocolVersion::new(1, 0, 5, None))).await;
        table.insert(contact(incompatible_version, ProtocolVersion::new(999, 0, 0, None))).await;
        table.insert(Contact::new("127.0.0.1", 4000, loopback, self_version.clone())).await;

        let removed = table.clean(&self_version, false).await;
        assert_eq!(removed.len(), 2);
        let remaining = table.all().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].node_id, compatible);
    }

    /// S6: seed the router with contacts of protocols `{self_version, "999.0.0",
    /// self_version+"-buildtag"}`; after cleaning, only the self_version contact (and
    /// compatible patch variants) remains.
    #[tokio::test]
    async fn s6_routing_table_cleaning_keeps_only_protocol_compatible_contacts() {
        let self_keys = KeyPair::generate();
        let self_version = ProtocolVersion::new(1, 4, 0, None);
        let table = RoutingTable::new(self_keys.node_id(), 20);

        let same = KeyPair::generate().node_id();
        let same_patch_variant = KeyPair::generate().node_id();
        let different_major = KeyPair::generate().node_id();
        let different_build = KeyPair::generate().node_id();

        table.insert(contact(same, self_version.clone())).await;
        table.insert(contact(same_patch_variant, ProtocolVersion::new(1, 4, 9, None))).await;
        table.insert(contact(different_major, ProtocolVersion::parse("999.0.0").unwrap())).await;
        table.insert(contact(different_build, ProtocolVersion::new(1, 4, 0, Some("buildtag")))).await;

        table.clean(&self_version, false).await;

        let remaining: std::collections::HashSet<_> = table.all().await.into_iter().map(|c| c.node_id).collect();
        assert_eq!(remaining, std::collections::HashSet::from([same, same_patch_variant]));
    }
}
