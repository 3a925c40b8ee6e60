//! FIND_TUNNEL and OPEN_TUNNEL (§4.7, §4.8): the two server-side handlers a publicly
//! reachable, tunneling-capable node runs so NAT-bound peers can find and use it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storj_crypto::NodeId;
use storj_protocol::ProtocolError;
use storj_rpc::{Contact, Handler, RpcError};

use crate::bucket::TunnelerBucket;
use crate::slots::RelaySlots;

#[derive(Serialize, Deserialize, Default)]
struct FindTunnelParams {}

#[derive(Serialize, Deserialize)]
struct FindTunnelResult {
    tunnelers: Vec<Contact>,
}

/// Answers FIND_TUNNEL with up to `k` contacts sampled from the local tunneler
/// bucket (§4.7). `k` is the node's own `find_tunnel_k` config value.
pub struct FindTunnelHandler {
    bucket: Arc<TunnelerBucket>,
    k: usize,
}

impl FindTunnelHandler {
    pub fn new(bucket: Arc<TunnelerBucket>, k: usize) -> Self {
        Self { bucket, k }
    }
}

#[async_trait]
impl Handler for FindTunnelHandler {
    async fn handle(&self, _sender: NodeId, _params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let tunnelers = self.bucket.sample(self.k).await;
        Ok(serde_json::to_value(FindTunnelResult { tunnelers }).map_err(ProtocolError::from)?)
    }
}

#[derive(Serialize, Deserialize)]
struct OpenTunnelParams {
    /// The requester's own claimed contact, since OPEN_TUNNEL is verification-exempt
    /// (§4.6) — the requester may not be routable yet, that's the whole point.
    requester: Contact,
}

#[derive(Serialize, Deserialize)]
struct OpenTunnelResult {
    tunnel: String,
    alias: Contact,
}

/// Answers OPEN_TUNNEL by allocating a relay slot, or [`ProtocolError::NoTunnelAvailable`]
/// if none remain (§4.7, §4.8).
pub struct OpenTunnelHandler {
    slots: Arc<RelaySlots>,
}

impl OpenTunnelHandler {
    pub fn new(slots: Arc<RelaySlots>) -> Self {
        Self { slots }
    }
}

#[async_trait]
impl Handler for OpenTunnelHandler {
    async fn handle(&self, _sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let OpenTunnelParams { requester } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

        match self.slots.allocate(requester.node_id).await {
            Some((tunnel, alias)) => Ok(serde_json::to_value(OpenTunnelResult { tunnel, alias })
                .map_err(ProtocolError::from)?),
            None => Err(ProtocolError::NoTunnelAvailable.into()),
        }
    }
}

/// Builds an OPEN_TUNNEL request body. Kept alongside the handler since both sides
/// agree on [`OpenTunnelParams`]'s shape.
pub fn open_tunnel_request_params(requester: &Contact) -> serde_json::Value {
    serde_json::json!(OpenTunnelParams { requester: requester.clone() })
}

/// The client-side decoded shape of an OPEN_TUNNEL success response.
pub struct OpenTunnelResponse {
    pub tunnel_url: String,
    pub alias: Contact,
}

pub fn parse_open_tunnel_result(value: serde_json::Value) -> Option<OpenTunnelResponse> {
    let OpenTunnelResult { tunnel, alias } = serde_json::from_value(value).ok()?;
    Some(OpenTunnelResponse { tunnel_url: tunnel, alias })
}

#[cfg(test)]
mod tests {
    use storj_crypto::{KeyPair, ProtocolVersion};

    use super::*;

    fn contact(node_id: NodeId) -> Contact {
        Contact::new("198.51.100.9", 5000, node_id, ProtocolVersion::new(1, 0, 0, None))
    }

    #[tokio::test]
    async fn find_tunnel_returns_at_most_k_contacts() {
        let bucket = Arc::new(TunnelerBucket::new(10));
        for _ in 0..5 {
            bucket.insert(contact(KeyPair::generate().node_id())).await;
        }
        let handler = FindTunnelHandler::new(bucket, 3);
        let result = handler.handle(KeyPair::generate().node_id(), serde_json::json!({})).await.unwrap();
        let FindTunnelResult { tunnelers } = serde_json::from_value(result).unwrap();
        assert_eq!(tunnelers.len(), 3);
    }

    #[tokio::test]
    async fn open_tunnel_fails_once_slots_are_exhausted() {
        let own = contact(KeyPair::generate().node_id());
        let slots = Arc::new(RelaySlots::new(1, own));
        let handler = OpenTunnelHandler::new(slots);

        let first = KeyPair::generate().node_id();
        let params = open_tunnel_request_params(&contact(first));
        handler.handle(first, params).await.unwrap();

        let second = KeyPair::generate().node_id();
        let params = open_tunnel_request_params(&contact(second));
        let err = handler.handle(second, params).await.unwrap_err();
        assert!(matches!(err, RpcError::Handler(_)));
    }
}
