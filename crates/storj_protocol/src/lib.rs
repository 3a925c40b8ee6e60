//! State machines for the overlay's contract-negotiation and audit protocol (§4.7):
//! OFFER, CONSIGN, RETRIEVE, AUDIT, MIRROR, PROBE, plus the opcode-topic publish/
//! subscribe contract market the handlers are wired to.
//!
//! `FIND_TUNNEL`/`OPEN_TUNNEL` are also protocol handlers per §6's method list, but
//! their state (the tunneler bucket) belongs to `storj_tunnel`; that crate implements
//! them directly against [`storj_rpc::Handler`] rather than this crate reaching back
//! into tunnel internals.

pub mod farmer;
pub mod offer;
pub mod opcode;
pub mod probe;
pub mod publication;

use storj_rpc::RpcError;
use thiserror::Error;

/// Errors raised by a protocol handler, distinct from the lower-level errors of the
/// crates it composes (contract, merkle, storage, data channel).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no publication registered under this id")]
    UnknownPublication,
    #[error("this publication already has a matched offer")]
    ContractAlreadyMatched,
    #[error("no contract registered under this id")]
    ContractUnknown,
    #[error("request body does not match the expected shape: {0}")]
    InvalidParams(String),
    #[error("no tunneler is currently available")]
    NoTunnelAvailable,
    #[error(transparent)]
    Contract(#[from] storj_contract::ContractError),
    #[error(transparent)]
    Audit(#[from] storj_merkle::AuditError),
    #[error(transparent)]
    Storage(#[from] storj_storage::StorageError),
    #[error(transparent)]
    ShardManager(#[from] storj_shard_manager::ShardManagerError),
    #[error(transparent)]
    DataChannel(#[from] storj_datachannel::DataChannelError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::Handler(err.to_string())
    }
}
