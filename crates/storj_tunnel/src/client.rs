//! The NAT-bound node's join-time fallback (§4.8): PROBE a seed; if unreachable,
//! FIND_TUNNEL from it; then try OPEN_TUNNEL against each returned tunneler in order
//! until one grants a slot. Actually relaying traffic through the granted tunnel is
//! NAT-traversal/relay-framing machinery the core spec places out of scope (§1); this
//! client only negotiates the grant and hands back the resulting alias.

use storj_protocol::probe;
use storj_rpc::{Contact, Method, RpcClient, RpcError};
use thiserror::Error;

use crate::handlers::{open_tunnel_request_params, parse_open_tunnel_result};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no tunneler accepted an open-tunnel request")]
    NoTunnelAvailable,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// The result of running [`TunnelClient::establish`]: either the node is directly
/// reachable and needs no tunnel, or it must advertise `alias` in place of its real
/// contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOutcome {
    DirectlyReachable,
    Tunneled { tunnel_url: String, alias: Contact },
}

/// Orchestrates §4.8's fallback sequence for one join attempt.
pub struct TunnelClient {
    client: RpcClient,
}

impl TunnelClient {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }

    /// Runs the fallback against a single seed: PROBE, then FIND_TUNNEL plus
    /// OPEN_TUNNEL attempts in order. Returns [`TunnelError::NoTunnelAvailable`] only
    /// after every returned tunneler has refused or failed to answer — a single
    /// tunneler's transport error does not abort the sequence, per §7's retry policy
    /// of excluding one faulty peer rather than failing the whole operation.
    pub async fn establish(&self, seed: &Contact, self_contact: &Contact) -> Result<TunnelOutcome, TunnelError> {
        let probe_params = probe::probe_request_params(self_contact);
        let probe_response = self.client.call_contact(seed, Method::Probe, probe_params).await?;
        if probe::parse_probe_result(probe_response) {
            return Ok(TunnelOutcome::DirectlyReachable);
        }

        let find_tunnel_response = self.client.call_contact(seed, Method::FindTunnel, serde_json::json!({})).await?;
        let tunnelers: Vec<Contact> = find_tunnel_response
            .get("tunnelers")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        for tunneler in &tunnelers {
            let params = open_tunnel_request_params(self_contact);
            let Ok(response) = self.client.call_contact(tunneler, Method::OpenTunnel, params).await else {
                continue;
            };
            if let Some(grant) = parse_open_tunnel_result(response) {
                return Ok(TunnelOutcome::Tunneled { tunnel_url: grant.tunnel_url, alias: grant.alias });
            }
        }

        Err(TunnelError::NoTunnelAvailable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use storj_crypto::{KeyPair, ProtocolVersion};
    use storj_rpc::{Envelope, Transport, TransportError};

    use super::*;
    use crate::slots::RelaySlots;

    fn contact(id: storj_crypto::NodeId, port: u16) -> Contact {
        Contact::new("198.51.100.3", port, id, ProtocolVersion::new(1, 0, 0, None))
    }

    /// A transport that answers PROBE as unreachable, FIND_TUNNEL with one tunneler,
    /// and OPEN_TUNNEL by delegating to a real [`RelaySlots`] so the grant shape is
    /// exercised end to end.
    struct FallbackTransport {
        seed: storj_crypto::NodeId,
        tunneler: storj_crypto::NodeId,
        tunneler_keys: KeyPair,
        slots: Arc<RelaySlots>,
    }

    #[async_trait]
    impl Transport for FallbackTransport {
        async fn request(&self, peer: storj_crypto::NodeId, _e: Envelope) -> Result<Envelope, TransportError> {
            Err(TransportError::Unreachable(peer))
        }

        async fn dial(&self, contact: &Contact, envelope: Envelope) -> Result<Envelope, TransportError> {
            if contact.node_id == self.seed {
                let result = match envelope.method {
                    storj_rpc::Method::Probe => serde_json::json!({"reachable": false}),
                    storj_rpc::Method::FindTunnel => {
                        serde_json::json!({"tunnelers": [contact_json(self.tunneler)]})
                    }
                    _ => serde_json::json!({}),
                };
                return Ok(Envelope::sign(envelope.method, storj_rpc::Body::Result(result), &self.tunneler_keys));
            }
            if contact.node_id == self.tunneler {
                let requester = self.slots.allocate(envelope_sender()).await;
                let result = match requester {
                    Some((tunnel, alias)) => serde_json::json!({"tunnel": tunnel, "alias": alias}),
                    None => return Err(TransportError::Unreachable(contact.node_id)),
                };
                return Ok(Envelope::sign(envelope.method, storj_rpc::Body::Result(result), &self.tunneler_keys));
            }
            Err(TransportError::Unreachable(contact.node_id))
        }
    }

    fn envelope_sender() -> storj_crypto::NodeId {
        // The mock transport doesn't thread the real caller id through `dial`; any
        // stable id is fine since `RelaySlots::allocate` only keys grants by it.
        storj_crypto::NodeId::from_hex(&"42".repeat(20)).unwrap()
    }

    fn contact_json(id: storj_crypto::NodeId) -> serde_json::Value {
        serde_json::json!(contact(id, 5000))
    }

    #[tokio::test]
    async fn falls_back_to_a_tunnel_when_unreachable() {
        let seed_keys = KeyPair::generate();
        let tunneler_keys = KeyPair::generate();
        let own_keys = KeyPair::generate();

        let tunneler_contact = contact(tunneler_keys.node_id(), 6000);
        let slots = Arc::new(RelaySlots::new(1, tunneler_contact.clone()));

        let transport = Arc::new(FallbackTransport {
            seed: seed_keys.node_id(),
            tunneler: tunneler_keys.node_id(),
            tunneler_keys: tunneler_keys.clone(),
            slots,
        });
        let client = RpcClient::new(own_keys.clone(), transport, Duration::from_secs(300));
        let tunnel_client = TunnelClient::new(client);

        let seed_contact = contact(seed_keys.node_id(), 4000);
        let self_contact = contact(own_keys.node_id(), 4001);

        let outcome = tunnel_client.establish(&seed_contact, &self_contact).await.unwrap();
        assert!(matches!(outcome, TunnelOutcome::Tunneled { .. }));
    }
}
