//! Signed storage contracts (§4.2).
//!
//! A [`Contract`] binds a shard hash to a specific farmer for a duration, with payment
//! terms and an audit budget. Every field except the two signatures is fixed at
//! construction — there is no setter — so "mutating a field after signing" is simply not
//! an operation this type exposes; the only state that advances after construction is
//! which signatures are present, monotonically, via [`Contract::sign`].
//!
//! `farmer_id` is a required constructor field here, not filled in later: the point in
//! the protocol the spec calls "filled on accept" is exactly the moment a farmer is
//! chosen and a concrete `Contract` is built (by `storj_protocol`'s OFFER handler) from a
//! renter-side publication that had no farmer yet. That earlier, farmer-less stage is
//! out of this crate's scope — it has no signatures to carry and isn't a `Contract`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use storj_crypto::{hash160, verify_hash160, KeyPair, NodeId};
use thiserror::Error;

/// Errors raised constructing, signing, or verifying a [`Contract`].
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("data_size must be greater than zero")]
    ZeroDataSize,
    #[error("store_end ({store_end}) must be greater than store_begin ({store_begin})")]
    StoreWindowInverted { store_begin: u64, store_end: u64 },
    #[error("{role:?} has already signed this contract")]
    AlreadySigned { role: Role },
    #[error("{role:?} signature is not present on this contract")]
    MissingSignature { role: Role },
    #[error("signing key's node id does not match the contract's {role:?}_id field")]
    WrongSigner { role: Role },
    #[error(transparent)]
    Crypto(#[from] storj_crypto::CryptoError),
    #[error("only a signing party may terminate a contract")]
    NotAParty,
}

/// Which side of a [`Contract`] a signature or action belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Renter,
    Farmer,
}

/// Where a contract sits in its signature lifecycle. Advances monotonically: neither
/// signature may be removed once present, and a terminated contract never un-terminates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    Init,
    RenterSigned,
    FarmerSigned,
    Complete,
}

/// Construction parameters for a new [`Contract`]. Both parties must already be known;
/// see the module docs for why `farmer_id` is not optional here.
#[derive(Clone, Debug)]
pub struct ContractFields {
    pub renter_id: NodeId,
    pub renter_hd_key: Option<String>,
    pub farmer_id: NodeId,
    pub data_size: u64,
    pub data_hash: [u8; 20],
    pub store_begin: u64,
    pub store_end: u64,
    pub audit_count: u32,
    pub payment_destination: String,
    pub payment_amount: u64,
}

/// A bilaterally signed storage agreement (§3's Contract data model).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contract {
    renter_id: NodeId,
    renter_hd_key: Option<String>,
    farmer_id: NodeId,
    data_size: u64,
    #[serde(with = "hex20")]
    data_hash: [u8; 20],
    store_begin: u64,
    store_end: u64,
    audit_count: u32,
    payment_destination: String,
    payment_amount: u64,
    #[serde(with = "hex65_opt")]
    renter_signature: Option<[u8; 65]>,
    #[serde(with = "hex65_opt")]
    farmer_signature: Option<[u8; 65]>,
    terminated: bool,
}

impl Contract {
    /// Validates §4.2's required invariants and builds an unsigned contract.
    pub fn new(fields: ContractFields) -> Result<Self, ContractError> {
        if fields.data_size == 0 {
            return Err(ContractError::ZeroDataSize);
        }
        if fields.store_end <= fields.store_begin {
            return Err(ContractError::StoreWindowInverted {
                store_begin: fields.store_begin,
                store_end: fields.store_end,
            });
        }
        Ok(Self {
            renter_id: fields.renter_id,
            renter_hd_key: fields.renter_hd_key,
            farmer_id: fields.farmer_id,
            data_size: fields.data_size,
            data_hash: fields.data_hash,
            store_begin: fields.store_begin,
            store_end: fields.store_end,
            audit_count: fields.audit_count,
            payment_destination: fields.payment_destination,
            payment_amount: fields.payment_amount,
            renter_signature: None,
            farmer_signature: None,
            terminated: false,
        })
    }

    pub fn renter_id(&self) -> NodeId {
        self.renter_id
    }

    pub fn farmer_id(&self) -> NodeId {
        self.farmer_id
    }

    pub fn data_hash(&self) -> [u8; 20] {
        self.data_hash
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn store_begin(&self) -> u64 {
        self.store_begin
    }

    pub fn store_end(&self) -> u64 {
        self.store_end
    }

    pub fn audit_count(&self) -> u32 {
        self.audit_count
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The document's position in its signature lifecycle.
    pub fn status(&self) -> ContractStatus {
        match (self.renter_signature.is_some(), self.farmer_signature.is_some()) {
            (false, false) => ContractStatus::Init,
            (true, false) => ContractStatus::RenterSigned,
            (false, true) => ContractStatus::FarmerSigned,
            (true, true) => ContractStatus::Complete,
        }
    }

    /// Deterministic JSON of every field except the two signatures, with keys in
    /// lexicographic order (guaranteed by serializing a `BTreeMap`, not the struct
    /// itself, so field-declaration order never leaks in). This is what both parties
    /// actually sign.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut fields: BTreeMap<&'static str, serde_json::Value> = BTreeMap::new();
        fields.insert("renter_id", serde_json::json!(self.renter_id.to_hex()));
        fields.insert("renter_hd_key", serde_json::json!(self.renter_hd_key));
        fields.insert("farmer_id", serde_json::json!(self.farmer_id.to_hex()));
        fields.insert("data_size", serde_json::json!(self.data_size));
        fields.insert("data_hash", serde_json::json!(hex::encode(self.data_hash)));
        fields.insert("store_begin", serde_json::json!(self.store_begin));
        fields.insert("store_end", serde_json::json!(self.store_end));
        fields.insert("audit_count", serde_json::json!(self.audit_count));
        fields.insert("payment_destination", serde_json::json!(self.payment_destination));
        fields.insert("payment_amount", serde_json::json!(self.payment_amount));
        serde_json::to_vec(&fields).expect("a BTreeMap of JSON scalars always serializes")
    }

    fn canonical_hash(&self) -> [u8; 20] {
        hash160(&self.canonical_bytes())
    }

    /// A content-addressed identifier for this contract: the hash160 of its canonical
    /// form. Stable across signing (the canonical form never includes the signatures),
    /// used as the wire-visible `contract_id` protocol handlers key on.
    pub fn id(&self) -> [u8; 20] {
        self.canonical_hash()
    }

    /// Signs the canonical form with `keypair`, filling in the signature slot for `role`.
    /// `keypair`'s derived NodeID must match the contract's `{role}_id` field.
    pub fn sign(&mut self, keypair: &KeyPair, role: Role) -> Result<(), ContractError> {
        let expected = match role {
            Role::Renter => self.renter_id,
            Role::Farmer => self.farmer_id,
        };
        if keypair.node_id() != expected {
            return Err(ContractError::WrongSigner { role });
        }
        let slot = match role {
            Role::Renter => &mut self.renter_signature,
            Role::Farmer => &mut self.farmer_signature,
        };
        if slot.is_some() {
            return Err(ContractError::AlreadySigned { role });
        }
        let digest = self.canonical_hash();
        *slot = Some(keypair.sign_hash160(&digest));
        Ok(())
    }

    /// Recomputes the canonical hash and checks `role`'s signature recovers to
    /// `expected_node_id`.
    pub fn verify(&self, role: Role, expected_node_id: NodeId) -> Result<(), ContractError> {
        let signature = match role {
            Role::Renter => self.renter_signature,
            Role::Farmer => self.farmer_signature,
        }
        .ok_or(ContractError::MissingSignature { role })?;
        verify_hash160(&self.canonical_hash(), &signature, expected_node_id)?;
        Ok(())
    }

    /// Both signatures present and verifying. A terminated contract may still be
    /// complete (§3: "the contract itself is jointly referenced"); use
    /// [`Contract::is_active`] to additionally exclude terminated contracts.
    pub fn is_complete(&self) -> bool {
        self.status() == ContractStatus::Complete
            && self.verify(Role::Renter, self.renter_id).is_ok()
            && self.verify(Role::Farmer, self.farmer_id).is_ok()
    }

    /// Complete and not terminated — the condition for "active contract" queries.
    pub fn is_active(&self) -> bool {
        self.is_complete() && !self.terminated
    }

    /// Marks the contract terminated. Idempotent; callable by either signing party.
    /// Per §3's StorageItem lifecycle note, termination is explicit and orthogonal to
    /// signature completeness — it never un-signs anything.
    pub fn terminate(&mut self, caller: NodeId) -> Result<(), ContractError> {
        if caller != self.renter_id && caller != self.farmer_id {
            return Err(ContractError::NotAParty);
        }
        self.terminated = true;
        Ok(())
    }
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

mod hex65_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<[u8; 65]>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 65]>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 65] =
                    v.try_into().map_err(|_| serde::de::Error::custom("expected 65 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use storj_crypto::hash160;

    use super::*;

    fn sample_fields(renter: NodeId, farmer: NodeId) -> ContractFields {
        ContractFields {
            renter_id: renter,
            renter_hd_key: None,
            farmer_id: farmer,
            data_size: 11,
            data_hash: hash160(b"hello storj"),
            store_begin: 0,
            store_end: 10_000,
            audit_count: 12,
            payment_destination: "3FZbgi29cpjq2GjdwV8eyHuJJnkLtktZc5".to_owned(),
            payment_amount: 1_000,
        }
    }

    /// Scenario S4.
    #[test]
    fn scenario_s4_contract_signing() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut contract = Contract::new(sample_fields(renter.node_id(), farmer.node_id())).unwrap();

        contract.sign(&renter, Role::Renter).unwrap();
        let other = KeyPair::generate();
        assert!(contract.verify(Role::Renter, other.node_id()).is_err());
        assert!(contract.verify(Role::Renter, renter.node_id()).is_ok());
        assert!(!contract.is_complete());

        contract.sign(&farmer, Role::Farmer).unwrap();
        assert!(contract.is_complete());
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let impostor = KeyPair::generate();
        let mut contract = Contract::new(sample_fields(renter.node_id(), farmer.node_id())).unwrap();
        let err = contract.sign(&impostor, Role::Renter).unwrap_err();
        assert!(matches!(err, ContractError::WrongSigner { role: Role::Renter }));
    }

    #[test]
    fn signing_twice_for_the_same_role_is_rejected() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut contract = Contract::new(sample_fields(renter.node_id(), farmer.node_id())).unwrap();
        contract.sign(&renter, Role::Renter).unwrap();
        let err = contract.sign(&renter, Role::Renter).unwrap_err();
        assert!(matches!(err, ContractError::AlreadySigned { role: Role::Renter }));
    }

    #[test]
    fn zero_data_size_is_rejected() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut fields = sample_fields(renter.node_id(), farmer.node_id());
        fields.data_size = 0;
        assert!(matches!(Contract::new(fields), Err(ContractError::ZeroDataSize)));
    }

    #[test]
    fn inverted_store_window_is_rejected() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut fields = sample_fields(renter.node_id(), farmer.node_id());
        fields.store_end = fields.store_begin;
        assert!(matches!(Contract::new(fields), Err(ContractError::StoreWindowInverted { .. })));
    }

    #[test]
    fn terminate_is_idempotent_and_keeps_completeness() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let mut contract = Contract::new(sample_fields(renter.node_id(), farmer.node_id())).unwrap();
        contract.sign(&renter, Role::Renter).unwrap();
        contract.sign(&farmer, Role::Farmer).unwrap();

        contract.terminate(renter.node_id()).unwrap();
        contract.terminate(farmer.node_id()).unwrap();
        assert!(contract.is_terminated());
        assert!(contract.is_complete());
        assert!(!contract.is_active());
    }

    #[test]
    fn terminate_by_non_party_is_rejected() {
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let stranger = KeyPair::generate();
        let mut contract = Contract::new(sample_fields(renter.node_id(), farmer.node_id())).unwrap();
        let err = contract.terminate(stranger.node_id()).unwrap_err();
        assert!(matches!(err, ContractError::NotAParty));
    }
}
