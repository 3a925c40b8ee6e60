//! Farmer side of CONSIGN, RETRIEVE, AUDIT and MIRROR (§4.7): bookkeeping for the
//! contracts a farmer has accepted, the public audit trees recorded against them, and
//! the handlers that answer a renter's requests against that state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storj_contract::Contract;
use storj_crypto::NodeId;
use storj_datachannel::TokenRegistry;
use storj_merkle::{build_proof, Challenge, Proof};
use storj_rpc::{Handler, RpcError};
use storj_shard_manager::ShardManager;
use storj_storage::{Item, ShardBody, ShardHash};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::ProtocolError;

/// Per-contract state a farmer keeps after accepting a contract: the contract itself
/// and, once CONSIGN has run, the renter's public audit leaves.
#[derive(Clone)]
struct AcceptedContract {
    contract: Contract,
    public_leaves: Option<Vec<[u8; 20]>>,
}

/// Everything the farmer-side handlers in this module share: the node's own key pair,
/// its shard manager, its data-channel token registry, and the bookkeeping above.
pub struct FarmerState {
    pub shard_manager: Arc<ShardManager>,
    pub tokens: Arc<TokenRegistry>,
    pub token_ttl: Duration,
    contracts: Mutex<HashMap<NodeId, AcceptedContract>>,
}

impl FarmerState {
    pub fn new(shard_manager: Arc<ShardManager>, tokens: Arc<TokenRegistry>, token_ttl: Duration) -> Self {
        Self { shard_manager, tokens, token_ttl, contracts: Mutex::new(HashMap::new()) }
    }

    /// Records a contract this farmer has accepted (both signatures present). Called
    /// once the farmer-initiated OFFER round trip completes.
    pub async fn record_contract(&self, contract: Contract) -> Result<(), ProtocolError> {
        if !contract.is_complete() {
            return Err(ProtocolError::InvalidParams("contract is not yet fully signed".to_owned()));
        }
        let id = NodeId(contract.id());
        self.contracts.lock().await.insert(id, AcceptedContract { contract, public_leaves: None });
        Ok(())
    }

    pub async fn contract_by_data_hash(&self, renter: NodeId, data_hash: [u8; 20]) -> Option<Contract> {
        let contracts = self.contracts.lock().await;
        contracts
            .values()
            .find(|entry| entry.contract.renter_id() == renter && entry.contract.data_hash() == data_hash)
            .map(|entry| entry.contract.clone())
    }

    async fn public_leaves_for(&self, data_hash: [u8; 20]) -> Option<Vec<[u8; 20]>> {
        let contracts = self.contracts.lock().await;
        contracts
            .values()
            .find(|entry| entry.contract.data_hash() == data_hash)
            .and_then(|entry| entry.public_leaves.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct ConsignParams {
    contract_id: NodeId,
    #[serde(with = "hex20_vec")]
    audit_tree: Vec<[u8; 20]>,
}

mod hex20_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(leaves: &[[u8; 20]], s: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = leaves.iter().map(hex::encode).collect();
        encoded.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<[u8; 20]>, D::Error> {
        let encoded = Vec::<String>::deserialize(d)?;
        encoded
            .into_iter()
            .map(|s| {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                bytes.try_into().map_err(|_| serde::de::Error::custom("expected 20 bytes"))
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct ConsignResult {
    token: storj_datachannel::TokenValue,
}

/// Farmer-side CONSIGN (§4.7): records the renter's public audit leaves against its
/// accepted contract and issues a one-shot PUSH token. Re-issuing for the same
/// contract before the shard has actually arrived is intentionally idempotent — the
/// old token is simply superseded, never double-counted.
pub struct ConsignHandler {
    state: Arc<FarmerState>,
}

impl ConsignHandler {
    pub fn new(state: Arc<FarmerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for ConsignHandler {
    async fn handle(&self, sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let ConsignParams { contract_id, audit_tree } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

        let mut contracts = self.state.contracts.lock().await;
        let entry = contracts.get_mut(&contract_id).ok_or(ProtocolError::ContractUnknown)?;
        if entry.contract.renter_id() != sender {
            return Err(ProtocolError::InvalidParams("sender is not the renter on this contract".to_owned()).into());
        }
        entry.public_leaves = Some(audit_tree);
        let hash = entry.contract.data_hash();
        let farmer_id = entry.contract.farmer_id();
        drop(contracts);

        let token = self.state.tokens.issue_push(hash, farmer_id, self.state.token_ttl).await;
        Ok(serde_json::to_value(ConsignResult { token }).map_err(ProtocolError::from)?)
    }
}

#[derive(Serialize, Deserialize)]
struct RetrieveParams {
    #[serde(with = "hex20")]
    data_hash: [u8; 20],
}

#[derive(Serialize, Deserialize)]
struct RetrieveResult {
    token: storj_datachannel::TokenValue,
}

/// Farmer-side RETRIEVE (§4.7): issues a PULL token once an active contract between
/// the requester and this farmer covers `data_hash`.
pub struct RetrieveHandler {
    state: Arc<FarmerState>,
}

impl RetrieveHandler {
    pub fn new(state: Arc<FarmerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for RetrieveHandler {
    async fn handle(&self, sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let RetrieveParams { data_hash } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

        let contract =
            self.state.contract_by_data_hash(sender, data_hash).await.ok_or(ProtocolError::ContractUnknown)?;
        if !contract.is_active() {
            return Err(ProtocolError::InvalidParams("contract is not active".to_owned()).into());
        }

        let token = self.state.tokens.issue_pull(data_hash, contract.farmer_id(), self.state.token_ttl).await;
        Ok(serde_json::to_value(RetrieveResult { token }).map_err(ProtocolError::from)?)
    }
}

#[derive(Serialize, Deserialize)]
struct AuditParams {
    #[serde(with = "hex20")]
    data_hash: [u8; 20],
    challenge: Challenge,
}

#[derive(Serialize, Deserialize)]
struct AuditResult {
    proof: Proof,
    depth: u32,
}

/// Farmer-side AUDIT (§4.7, §4.1): reads the shard, answers the renter's challenge
/// with a Merkle proof over the recorded public leaves.
pub struct AuditHandler {
    state: Arc<FarmerState>,
}

impl AuditHandler {
    pub fn new(state: Arc<FarmerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for AuditHandler {
    async fn handle(&self, _sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let AuditParams { data_hash, challenge } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

        let leaves = self.state.public_leaves_for(data_hash).await.ok_or(ProtocolError::ContractUnknown)?;
        let key = ShardHash::from_hex(&hex::encode(data_hash)).expect("20-byte hash is always valid hex");
        let Item { shard, .. } = self.state.shard_manager.get(&key).await.map_err(ProtocolError::from)?;
        let ShardBody::Readable(mut reader) = shard else {
            return Err(ProtocolError::ContractUnknown.into());
        };
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.map_err(storj_storage::StorageError::Io).map_err(ProtocolError::from)?;

        let (proof, depth) = build_proof(&leaves, &challenge, &bytes).map_err(ProtocolError::from)?;
        Ok(serde_json::to_value(AuditResult { proof, depth }).map_err(ProtocolError::from)?)
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

/// Pulls a shard's bytes from another farmer over a PULL data channel, given a
/// previously-issued token. Abstracted so `storj_protocol` doesn't need to own actual
/// connection dialing, which belongs to the transport layer.
#[async_trait]
pub trait ShardSource: Send + Sync {
    async fn pull_shard(
        &self,
        contact: &str,
        token: storj_datachannel::TokenValue,
        hash: [u8; 20],
    ) -> Result<Vec<u8>, ProtocolError>;
}

#[derive(Serialize, Deserialize)]
struct MirrorParams {
    source_contract: Contract,
    source_farmer_contact: String,
    token: storj_datachannel::TokenValue,
}

#[derive(Serialize, Deserialize)]
struct MirrorResult {
    accepted: bool,
}

/// Farmer-side MIRROR (§4.7): pulls a shard from another farmer using a token the
/// renter obtained on the requester's behalf, then stores it under a new contract with
/// the requesting renter.
pub struct MirrorHandler {
    state: Arc<FarmerState>,
    source: Arc<dyn ShardSource>,
}

impl MirrorHandler {
    pub fn new(state: Arc<FarmerState>, source: Arc<dyn ShardSource>) -> Self {
        Self { state, source }
    }
}

#[async_trait]
impl Handler for MirrorHandler {
    async fn handle(&self, sender: NodeId, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let MirrorParams { source_contract, source_farmer_contact, token } =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;

        let hash = source_contract.data_hash();
        let bytes = self.source.pull_shard(&source_farmer_contact, token, hash).await?;

        let key = ShardHash::from_hex(&hex::encode(hash)).expect("20-byte hash is always valid hex");
        let mut item = storj_storage::ItemMeta::new(key);
        let new_contract =
            self.state.contracts.lock().await.values().find(|e| e.contract.data_hash() == hash).map(|e| e.contract.clone());
        if let Some(contract) = new_contract {
            item.contracts.insert(sender, contract);
        }
        self.state.shard_manager.put(&key, item).await.map_err(ProtocolError::from)?;

        let mut sink = self.state.shard_manager.get(&key).await.map_err(ProtocolError::from)?;
        if let ShardBody::Writable(mut writer) = sink.shard {
            use tokio::io::AsyncWriteExt;
            writer.write_all(&bytes).await.map_err(storj_storage::StorageError::Io).map_err(ProtocolError::from)?;
            writer.shutdown().await.map_err(storj_storage::StorageError::Io).map_err(ProtocolError::from)?;
        }

        Ok(serde_json::to_value(MirrorResult { accepted: true }).map_err(ProtocolError::from)?)
    }
}
