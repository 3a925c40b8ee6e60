//! PROBE (§4.7, §4.9): a joining node asks a seed to dial it back, so it can tell
//! whether it is publicly reachable or needs a tunnel. PROBE is one of the three
//! verification-exempt methods (§4.6) — answering it is exactly how an unverifiable
//! contact becomes verifiable in the first place, so the handler must not assume the
//! sender is already known.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storj_crypto::NodeId;
use storj_rpc::{Contact, Handler, Method, RpcClient, RpcError};

use crate::ProtocolError;

#[derive(Serialize, Deserialize)]
struct ProbeParams {
    /// The sender's own claimed contact, since PROBE must work before the sender is in
    /// anyone's routing table and an envelope alone carries no address.
    contact: Contact,
}

#[derive(Serialize, Deserialize)]
struct ProbeResult {
    reachable: bool,
}

/// Answers a PROBE by dialing the claimed contact back with a PING and reporting
/// whether it answered. `client` is this node's own [`RpcClient`], reused for the
/// reverse dial rather than standing up a second transport.
pub struct ProbeHandler {
    client: RpcClient,
}

impl ProbeHandler {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Handler for ProbeHandler {
    async fn handle(&self, _sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let ProbeParams { contact } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

        let reachable =
            self.client.call_contact(&contact, Method::Ping, serde_json::json!({})).await.is_ok();

        Ok(serde_json::to_value(ProbeResult { reachable }).map_err(ProtocolError::from)?)
    }
}

/// The client-side half: builds the PROBE request body for a node asking to be
/// probed. Kept alongside the handler since both sides agree on `ProbeParams`'s shape.
pub fn probe_request_params(self_contact: &Contact) -> serde_json::Value {
    serde_json::json!(ProbeParams { contact: self_contact.clone() })
}

/// Whether a decoded PROBE response reported reachability. Returns `false` on any
/// shape mismatch rather than erroring — an unreadable PROBE response is treated the
/// same as an unreachable node.
pub fn parse_probe_result(value: serde_json::Value) -> bool {
    serde_json::from_value::<ProbeResult>(value).map(|r| r.reachable).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use storj_crypto::{KeyPair, ProtocolVersion};
    use storj_rpc::{Envelope, Transport, TransportError};

    use super::*;

    /// A transport whose `dial` always answers PING successfully, simulating a
    /// reachable probe target.
    struct AlwaysReachable {
        farmer: KeyPair,
    }

    #[async_trait]
    impl Transport for AlwaysReachable {
        async fn request(&self, peer: NodeId, _envelope: Envelope) -> Result<Envelope, TransportError> {
            Err(TransportError::Unreachable(peer))
        }

        async fn dial(&self, contact: &Contact, envelope: Envelope) -> Result<Envelope, TransportError> {
            assert_eq!(contact.node_id, self.farmer.node_id());
            Ok(envelope.respond(serde_json::json!({}), &self.farmer))
        }
    }

    struct NeverReachable;

    #[async_trait]
    impl Transport for NeverReachable {
        async fn request(&self, peer: NodeId, _envelope: Envelope) -> Result<Envelope, TransportError> {
            Err(TransportError::Unreachable(peer))
        }
    }

    fn sample_contact(node: NodeId) -> Contact {
        Contact::new("198.51.100.7", 4001, node, ProtocolVersion::new(1, 0, 0, None))
    }

    #[tokio::test]
    async fn a_reachable_contact_is_reported_reachable() {
        let prober = KeyPair::generate();
        let target = KeyPair::generate();
        let transport = Arc::new(AlwaysReachable { farmer: target.clone() });
        let client = RpcClient::new(prober, transport, Duration::from_secs(300));
        let handler = ProbeHandler::new(client);

        let params = serde_json::to_value(ProbeParams { contact: sample_contact(target.node_id()) }).unwrap();
        let result = handler.handle(target.node_id(), params).await.unwrap();
        let ProbeResult { reachable } = serde_json::from_value(result).unwrap();
        assert!(reachable);
    }

    #[tokio::test]
    async fn an_unreachable_contact_is_reported_unreachable_not_errored() {
        let prober = KeyPair::generate();
        let target = KeyPair::generate();
        let transport = Arc::new(NeverReachable);
        let client = RpcClient::new(prober, transport, Duration::from_secs(300));
        let handler = ProbeHandler::new(client);

        let params = serde_json::to_value(ProbeParams { contact: sample_contact(target.node_id()) }).unwrap();
        let result = handler.handle(target.node_id(), params).await.unwrap();
        let ProbeResult { reachable } = serde_json::from_value(result).unwrap();
        assert!(!reachable);
    }
}
