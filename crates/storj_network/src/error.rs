//! Errors surfaced by the network facade's join/leave lifecycle.

use storj_rpc::{ContactError, RpcError};
use storj_tunnel::TunnelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("none of the {attempted} configured seeds answered")]
    NoSeedReachable { attempted: usize },
    #[error("a seed contact URI failed to parse: {0}")]
    InvalidSeed(#[from] ContactError),
    #[error("tunnel fallback failed: {0}")]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}
