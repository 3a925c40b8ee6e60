//! Renter side of OFFER (§4.7): a farmer proposes a signed contract against one of the
//! renter's open publications; the renter verifies, countersigns, and responds with
//! the completed contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storj_contract::{Contract, Role};
use storj_crypto::{KeyPair, NodeId};
use storj_rpc::{Handler, RpcError};
use tokio::sync::Mutex;

use crate::publication::PublicationRegistry;
use crate::ProtocolError;

#[derive(Serialize, Deserialize)]
struct OfferParams {
    contract: Contract,
}

#[derive(Serialize, Deserialize)]
struct OfferResult {
    contract: Contract,
}

/// Renter-side OFFER handler. A publication's id is its contract's `data_hash`
/// reinterpreted as a [`NodeId`] — one open publication per shard a renter is seeking
/// storage for, which is the only identifier OFFER's `{contract}` body carries back.
pub struct OfferHandler {
    keypair: KeyPair,
    publications: Arc<PublicationRegistry>,
    completed: Mutex<HashMap<NodeId, Contract>>,
}

impl OfferHandler {
    pub fn new(keypair: KeyPair, publications: Arc<PublicationRegistry>) -> Self {
        Self { keypair, publications, completed: Mutex::new(HashMap::new()) }
    }

    pub async fn completed_contract(&self, data_hash: [u8; 20]) -> Option<Contract> {
        self.completed.lock().await.get(&NodeId(data_hash)).cloned()
    }

    async fn accept(&self, mut contract: Contract, farmer: NodeId) -> Result<Contract, ProtocolError> {
        contract.verify(Role::Farmer, farmer)?;

        let publication_id = NodeId(contract.data_hash());
        let publication = self.publications.get(publication_id).await.ok_or(ProtocolError::UnknownPublication)?;
        if publication.renter_id != self.keypair.node_id()
            || publication.data_size != contract.data_size()
            || publication.store_begin != contract.store_begin()
            || publication.store_end != contract.store_end()
            || publication.audit_count != contract.audit_count()
        {
            return Err(ProtocolError::InvalidParams("offered contract does not match the publication".to_owned()));
        }

        // Only a contract that already matches the publication consumes the claim, so a
        // malformed offer can never block a later, valid one.
        self.publications.claim(publication_id).await?;
        contract.sign(&self.keypair, Role::Renter)?;
        self.completed.lock().await.insert(publication_id, contract.clone());
        Ok(contract)
    }
}

#[async_trait]
impl Handler for OfferHandler {
    async fn handle(&self, sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let OfferParams { contract } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
        let completed = self.accept(contract, sender).await?;
        Ok(serde_json::to_value(OfferResult { contract: completed }).map_err(ProtocolError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use storj_contract::ContractFields;

    use super::*;
    use crate::publication::Publication;

    fn publish_fields(renter: NodeId, farmer: NodeId) -> ContractFields {
        ContractFields {
            renter_id: renter,
            renter_hd_key: None,
            farmer_id: farmer,
            data_size: 11,
            data_hash: storj_crypto::hash160(b"hello storj"),
            store_begin: 0,
            store_end: 10_000,
            audit_count: 12,
            payment_destination: "addr".to_owned(),
            payment_amount: 10,
        }
    }

    #[tokio::test]
    async fn a_matching_offer_is_countersigned_and_completed() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let registry = Arc::new(PublicationRegistry::new());
        let data_hash = storj_crypto::hash160(b"hello storj");
        registry
            .publish(
                NodeId(data_hash),
                Publication {
                    renter_id: renter.node_id(),
                    data_size: 11,
                    data_hash,
                    store_begin: 0,
                    store_end: 10_000,
                    audit_count: 12,
                    payment_destination: "addr".to_owned(),
                    payment_amount: 10,
                },
            )
            .await;

        let handler = OfferHandler::new(renter.clone(), registry);
        let mut contract = Contract::new(publish_fields(renter.node_id(), farmer.node_id())).unwrap();
        contract.sign(&farmer, Role::Farmer).unwrap();

        let params = serde_json::to_value(OfferParams { contract }).unwrap();
        let result = handler.handle(farmer.node_id(), params).await.unwrap();
        let OfferResult { contract: completed } = serde_json::from_value(result).unwrap();
        assert!(completed.is_complete());
    }

    #[tokio::test]
    async fn a_second_offer_on_the_same_publication_is_rejected() {
        let renter = KeyPair::generate();
        let farmer_a = KeyPair::generate();
        let farmer_b = KeyPair::generate();
        let registry = Arc::new(PublicationRegistry::new());
        let data_hash = storj_crypto::hash160(b"hello storj");
        registry
            .publish(
                NodeId(data_hash),
                Publication {
                    renter_id: renter.node_id(),
                    data_size: 11,
                    data_hash,
                    store_begin: 0,
                    store_end: 10_000,
                    audit_count: 12,
                    payment_destination: "addr".to_owned(),
                    payment_amount: 10,
                },
            )
            .await;
        let handler = OfferHandler::new(renter.clone(), registry);

        let mut contract_a = Contract::new(publish_fields(renter.node_id(), farmer_a.node_id())).unwrap();
        contract_a.sign(&farmer_a, Role::Farmer).unwrap();
        handler
            .handle(farmer_a.node_id(), serde_json::to_value(OfferParams { contract: contract_a }).unwrap())
            .await
            .unwrap();

        let mut contract_b = Contract::new(publish_fields(renter.node_id(), farmer_b.node_id())).unwrap();
        contract_b.sign(&farmer_b, Role::Farmer).unwrap();
        let err = handler
            .handle(farmer_b.node_id(), serde_json::to_value(OfferParams { contract: contract_b }).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Handler(_)));
    }
}
