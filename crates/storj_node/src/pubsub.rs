//! A concrete realization of `storj_tunnel::PubSub`.
//!
//! Like the transport, the overlay's real pub/sub mesh is `libp2p::gossipsub`
//! (SPEC_FULL §2), out of scope here. This is an in-process fan-out: every
//! subscriber in the same node process receives every publish on its topic. That is
//! enough to exercise the tunneler announce/bucket loop end to end within a single
//! binary; a deployment wiring real gossipsub would swap this module out and nothing
//! above `storj_tunnel::PubSub` would need to change.

use std::collections::HashMap;
use std::sync::Arc;

use storj_crypto::NodeId;
use storj_protocol::opcode::OpcodeTopic;
use storj_tunnel::{PubSub, PubSubError, TopicHandler};
use tokio::sync::Mutex;

pub struct LocalPubSub {
    self_id: NodeId,
    subscribers: Mutex<HashMap<[u8; 3], Vec<Arc<dyn TopicHandler>>>>,
}

impl LocalPubSub {
    pub fn new(self_id: NodeId) -> Arc<Self> {
        Arc::new(Self { self_id, subscribers: Mutex::new(HashMap::new()) })
    }
}

#[async_trait::async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, topic: OpcodeTopic, payload: serde_json::Value) -> Result<(), PubSubError> {
        let subscribers = self.subscribers.lock().await;
        if let Some(handlers) = subscribers.get(&topic.0) {
            for handler in handlers {
                handler.on_message(self.self_id, payload.clone()).await;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: OpcodeTopic, handler: Arc<dyn TopicHandler>) -> Result<(), PubSubError> {
        self.subscribers.lock().await.entry(topic.0).or_default().push(handler);
        Ok(())
    }
}
