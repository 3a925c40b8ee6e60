//! A minimal publish/subscribe seam over [`OpcodeTopic`]s (§4.7's contract market,
//! §4.8's tunneler announcements). The overlay's actual pub/sub transport is
//! `libp2p::gossipsub` (SPEC_FULL §2) and out of this crate's scope; this trait is the
//! same kind of thin seam `storj_rpc::Transport` is for request/response.

use async_trait::async_trait;
use storj_crypto::NodeId;
use storj_protocol::opcode::OpcodeTopic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Receives messages published on a topic this node has subscribed to.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn on_message(&self, sender: NodeId, payload: serde_json::Value);
}

/// Publish/subscribe over opcode topics. Implementations own the underlying gossipsub
/// mesh; this crate only needs to publish tunneler announcements and subscribe a
/// [`TopicHandler`] to receive them.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: OpcodeTopic, payload: serde_json::Value) -> Result<(), PubSubError>;

    async fn subscribe(&self, topic: OpcodeTopic, handler: std::sync::Arc<dyn TopicHandler>) -> Result<(), PubSubError>;
}
