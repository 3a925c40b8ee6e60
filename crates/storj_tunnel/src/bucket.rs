//! The tunneler bucket (§4.8, §5): contacts harvested from availability
//! announcements, evicting the oldest entry when full, as §5's "Shared resources" row
//! requires ("insertion with eviction of the oldest when full").

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storj_crypto::NodeId;
use storj_rpc::Contact;
use tokio::sync::Mutex;

use crate::pubsub::TopicHandler;

/// The body of a tunneler availability/withdrawal announcement (§4.8): published on
/// `(PREFIX_TUNNELER || AVAIL)` or `(PREFIX_TUNNELER || UNAVAIL)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelerAnnouncement {
    pub contact: Contact,
}

/// A FIFO-ordered, capacity-bounded set of known tunneler contacts. New arrivals evict
/// the oldest entry once the bucket is full; an explicit withdrawal removes a contact
/// immediately regardless of position.
pub struct TunnelerBucket {
    capacity: usize,
    order: Mutex<VecDeque<NodeId>>,
    contacts: Mutex<std::collections::HashMap<NodeId, Contact>>,
}

impl TunnelerBucket {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: Mutex::new(VecDeque::new()), contacts: Mutex::new(std::collections::HashMap::new()) }
    }

    pub async fn insert(&self, contact: Contact) {
        let id = contact.node_id;
        let mut order = self.order.lock().await;
        let mut contacts = self.contacts.lock().await;

        if !contacts.contains_key(&id) {
            if order.len() >= self.capacity {
                if let Some(oldest) = order.pop_front() {
                    contacts.remove(&oldest);
                }
            }
            order.push_back(id);
        }
        contacts.insert(id, contact);
    }

    pub async fn withdraw(&self, id: NodeId) {
        let mut order = self.order.lock().await;
        let mut contacts = self.contacts.lock().await;
        contacts.remove(&id);
        order.retain(|existing| *existing != id);
    }

    /// Up to `k` known tunneler contacts, oldest first, for a FIND_TUNNEL response
    /// (§4.7).
    pub async fn sample(&self, k: usize) -> Vec<Contact> {
        let order = self.order.lock().await;
        let contacts = self.contacts.lock().await;
        order.iter().filter_map(|id| contacts.get(id).cloned()).take(k).collect()
    }

    pub async fn len(&self) -> usize {
        self.order.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Wires [`TunnelerBucket`] up to the pub/sub layer: an AVAIL announcement inserts,
/// an UNAVAIL announcement withdraws. The bucket doesn't care which topic byte carried
/// the message — the caller subscribes this handler to both AVAIL and UNAVAIL topics
/// and tells it, at construction, which behaviour to apply.
pub struct BucketSubscriber {
    bucket: Arc<TunnelerBucket>,
    available: bool,
}

impl BucketSubscriber {
    pub fn new(bucket: Arc<TunnelerBucket>, available: bool) -> Self {
        Self { bucket, available }
    }
}

#[async_trait]
impl TopicHandler for BucketSubscriber {
    async fn on_message(&self, _sender: NodeId, payload: serde_json::Value) {
        let Ok(announcement) = serde_json::from_value::<TunnelerAnnouncement>(payload) else {
            tracing::warn!("discarding malformed tunneler announcement");
            return;
        };
        if self.available {
            self.bucket.insert(announcement.contact).await;
        } else {
            self.bucket.withdraw(announcement.contact.node_id).await;
        }
    }
}
