//! The tunneler announce/withdraw loop (§4.8, §5 "tunnel-announce interval"): a
//! publicly reachable node with free relay slots periodically republishes its
//! availability; a node that is full or shutting down withdraws.

use std::sync::Arc;
use std::time::Duration;

use storj_protocol::opcode::OpcodeTopic;
use storj_rpc::Contact;

use crate::bucket::TunnelerAnnouncement;
use crate::pubsub::PubSub;
use crate::slots::RelaySlots;

/// Runs until `shutdown` fires, publishing an AVAIL announcement on every tick while
/// at least one relay slot is free, and UNAVAIL otherwise. Publishes a final UNAVAIL
/// on shutdown so peers don't keep a stale entry in their tunneler bucket.
pub async fn run_announce_loop(
    pubsub: Arc<dyn PubSub>,
    own_contact: Contact,
    slots: Arc<RelaySlots>,
    interval: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) {
    if slots.max_tunnels() == 0 {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    let payload = serde_json::json!(TunnelerAnnouncement { contact: own_contact.clone() });

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let available = slots.available_slots().await > 0;
                let topic = OpcodeTopic::tunneler_availability(available);
                if let Err(err) = pubsub.publish(topic, payload.clone()).await {
                    tracing::warn!(%err, "failed to publish tunneler announcement");
                }
            }
            _ = shutdown.notified() => {
                let topic = OpcodeTopic::tunneler_availability(false);
                let _ = pubsub.publish(topic, payload).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use storj_crypto::{KeyPair, ProtocolVersion};
    use tokio::sync::Mutex;

    use super::*;
    use crate::pubsub::{PubSubError, TopicHandler};

    #[derive(Default)]
    struct RecordingPubSub {
        published: Mutex<Vec<OpcodeTopic>>,
        count: AtomicUsize,
    }

    #[async_trait]
    impl PubSub for RecordingPubSub {
        async fn publish(&self, topic: OpcodeTopic, _payload: serde_json::Value) -> Result<(), PubSubError> {
            self.published.lock().await.push(topic);
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: OpcodeTopic,
            _handler: Arc<dyn TopicHandler>,
        ) -> Result<(), PubSubError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_full_relay_announces_unavailable() {
        let own =
            Contact::new("203.0.113.1", 4000, KeyPair::generate().node_id(), ProtocolVersion::new(1, 0, 0, None));
        let slots = Arc::new(RelaySlots::new(1, own.clone()));
        slots.allocate(KeyPair::generate().node_id()).await.unwrap();

        let pubsub = Arc::new(RecordingPubSub::default());
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let handle = tokio::spawn(run_announce_loop(
            pubsub.clone(),
            own,
            slots,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::advance(Duration::from_millis(15)).await;
        shutdown.notify_one();
        handle.await.unwrap();

        let published = pubsub.published.lock().await;
        assert!(published.len() >= 2, "expected at least one tick plus the shutdown withdrawal");
        assert!(published.iter().all(|topic| !topic.is_tunneler_topic() || topic.descriptor()[0] == 0));
    }

    #[tokio::test]
    async fn a_tunnel_client_with_no_relay_slots_never_announces() {
        let own =
            Contact::new("203.0.113.1", 4000, KeyPair::generate().node_id(), ProtocolVersion::new(1, 0, 0, None));
        let slots = Arc::new(RelaySlots::new(0, own.clone()));
        let pubsub = Arc::new(RecordingPubSub::default());
        let shutdown = Arc::new(tokio::sync::Notify::new());

        run_announce_loop(pubsub.clone(), own, slots, Duration::from_millis(10), shutdown).await;
        assert!(pubsub.published.lock().await.is_empty());
    }
}
