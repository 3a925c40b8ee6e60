//! Renter-side publish/offer bookkeeping (§4.7's OFFER row and §5's "pending-contracts
//! map ... guarded by a per-key lock so the first OFFER wins").

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storj_crypto::NodeId;
use tokio::sync::Mutex;

use crate::opcode::OpcodeTopic;
use crate::ProtocolError;

/// A unique id for one publication, assigned by the renter when it publishes.
pub type PublicationId = NodeId;

/// The terms a renter publishes before any farmer is chosen — everything a completed
/// [`storj_contract::Contract`] needs except `farmer_id` and the farmer's signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Publication {
    pub renter_id: NodeId,
    pub data_size: u64,
    #[serde(with = "hex20")]
    pub data_hash: [u8; 20],
    pub store_begin: u64,
    pub store_end: u64,
    pub audit_count: u32,
    pub payment_destination: String,
    pub payment_amount: u64,
}

mod hex20 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 20], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("expected 20 bytes"))
    }
}

impl Publication {
    pub fn topic(&self) -> OpcodeTopic {
        OpcodeTopic::data_contract(self.data_size)
    }
}

/// Tracks every publication the renter currently has open, and which ones already
/// have a matched offer. One lock per publication id, so two OFFERs racing on the same
/// publication serialize and only the first succeeds (§5).
#[derive(Default)]
pub struct PublicationRegistry {
    publications: Mutex<HashMap<PublicationId, Publication>>,
    locks: Mutex<HashMap<PublicationId, Arc<Mutex<bool>>>>,
}

impl PublicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, id: PublicationId, publication: Publication) {
        self.publications.lock().await.insert(id, publication);
    }

    pub async fn get(&self, id: PublicationId) -> Option<Publication> {
        self.publications.lock().await.get(&id).cloned()
    }

    async fn lock_for(&self, id: PublicationId) -> Arc<Mutex<bool>> {
        self.locks.lock().await.entry(id).or_insert_with(|| Arc::new(Mutex::new(false))).clone()
    }

    /// Attempts to claim `id` for an incoming offer. Returns the matching
    /// [`Publication`] and holds the claim so a concurrent, racing call returns
    /// [`ProtocolError::ContractAlreadyMatched`] instead. The claim is permanent once
    /// granted: a publication is matched at most once.
    pub async fn claim(&self, id: PublicationId) -> Result<Publication, ProtocolError> {
        let lock = self.lock_for(id).await;
        let mut matched = lock.lock().await;
        if *matched {
            return Err(ProtocolError::ContractAlreadyMatched);
        }
        let publication = self.publications.lock().await.get(&id).cloned().ok_or(ProtocolError::UnknownPublication)?;
        *matched = true;
        Ok(publication)
    }

    pub async fn withdraw(&self, id: PublicationId) {
        self.publications.lock().await.remove(&id);
        self.locks.lock().await.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(renter_id: NodeId) -> Publication {
        Publication {
            renter_id,
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
    async fn only_the_first_of_two_racing_claims_succeeds() {
        let registry = PublicationRegistry::new();
        let renter = storj_crypto::KeyPair::generate().node_id();
        let id = storj_crypto::KeyPair::generate().node_id();
        registry.publish(id, sample(renter)).await;

        registry.claim(id).await.unwrap();
        let err = registry.claim(id).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ContractAlreadyMatched));
    }

    #[tokio::test]
    async fn claiming_an_unknown_publication_fails() {
        let registry = PublicationRegistry::new();
        let bogus = storj_crypto::KeyPair::generate().node_id();
        let err = registry.claim(bogus).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPublication));
    }
}
