//! Per-shard streaming transport, separate from the RPC channel (§4.4).
//!
//! A client opens a connection to the farmer's advertised address and sends a control
//! frame — `{token, hash, operation}` — followed immediately by raw bytes (for PUSH) or
//! immediately reads raw bytes back (for PULL). [`TokenRegistry`] tracks which tokens
//! are live and enforces single-use (PUSH) vs. TTL-reuse (PULL) semantics and the
//! one-in-flight-transfer-per-token rule.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use storj_crypto::NodeId;
use storj_storage::{ShardBody, ShardHash, StorageAdapter, StorageError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Number of bytes in a [`TokenValue`]: 160 bits, per §3.
pub const TOKEN_LEN: usize = 20;

/// An opaque, single-use-or-TTL credential identifying one data-channel operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenValue(#[serde(with = "hex_bytes")] pub [u8; TOKEN_LEN]);

impl TokenValue {
    pub fn random() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenValue({})", hex::encode(self.0))
    }
}

mod hex_bytes {
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

/// The operation a [`TokenValue`] authorizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Push,
    Pull,
}

/// The JSON control frame sent at the start of every data-channel connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlFrame {
    pub token: TokenValue,
    #[serde(with = "hex20")]
    pub hash: [u8; 20],
    pub operation: Operation,
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

/// Errors raised handshaking or servicing a data-channel connection.
#[derive(Debug, Error)]
pub enum DataChannelError {
    #[error("token is unknown or already consumed")]
    InvalidToken,
    #[error("token has exceeded its TTL")]
    TokenExpired,
    #[error("control frame hash does not match the token's bound shard hash")]
    HashMismatch,
    #[error("token references a contract this farmer no longer tracks")]
    ContractUnknown,
    #[error("storage adapter has no remaining capacity")]
    StorageFull,
    #[error("channel closed unexpectedly: {0}")]
    ChannelClosed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug)]
struct TokenState {
    operation: Operation,
    hash: [u8; 20],
    farmer_id: NodeId,
    expires_at: Instant,
    /// Set once a PUSH token is consumed (single-use) or a transfer on this token is
    /// in flight (enforces §4.4's "at most one in-flight transfer per token").
    in_flight_or_consumed: bool,
}

impl TokenState {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Tracks every live token issued by CONSIGN (PUSH) or RETRIEVE (PULL).
#[derive(Clone, Default)]
pub struct TokenRegistry {
    tokens: Arc<Mutex<HashMap<TokenValue, TokenState>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a single-use PUSH token scoped to `hash`, owned by `farmer_id`.
    pub async fn issue_push(&self, hash: [u8; 20], farmer_id: NodeId, ttl: Duration) -> TokenValue {
        self.issue(Operation::Push, hash, farmer_id, ttl).await
    }

    /// Issues a TTL-reusable PULL token scoped to `hash`, owned by `farmer_id`.
    pub async fn issue_pull(&self, hash: [u8; 20], farmer_id: NodeId, ttl: Duration) -> TokenValue {
        self.issue(Operation::Pull, hash, farmer_id, ttl).await
    }

    async fn issue(&self, operation: Operation, hash: [u8; 20], farmer_id: NodeId, ttl: Duration) -> TokenValue {
        let value = TokenValue::random();
        let state = TokenState {
            operation,
            hash,
            farmer_id,
            expires_at: Instant::now() + ttl,
            in_flight_or_consumed: false,
        };
        self.tokens.lock().await.insert(value, state);
        value
    }

    /// Revokes a token outright (e.g. the bound contract was terminated).
    pub async fn revoke(&self, token: TokenValue) {
        self.tokens.lock().await.remove(&token);
    }

    /// Validates `frame` against the registry and reserves the token's single
    /// in-flight slot. Returns the farmer id the token was issued under so the
    /// caller can scope storage access.
    async fn reserve(&self, frame: &ControlFrame) -> Result<NodeId, DataChannelError> {
        let mut tokens = self.tokens.lock().await;
        let state = tokens.get_mut(&frame.token).ok_or(DataChannelError::InvalidToken)?;

        if state.operation != frame.operation {
            return Err(DataChannelError::InvalidToken);
        }
        if state.is_expired(Instant::now()) {
            return Err(DataChannelError::TokenExpired);
        }
        if state.hash != frame.hash {
            return Err(DataChannelError::HashMismatch);
        }
        if state.in_flight_or_consumed {
            return Err(DataChannelError::InvalidToken);
        }

        state.in_flight_or_consumed = true;
        Ok(state.farmer_id)
    }

    /// Releases the in-flight slot without consuming the token (used when a PULL
    /// completes, since PULL tokens may be reused within their TTL).
    async fn release(&self, token: TokenValue) {
        if let Some(state) = self.tokens.lock().await.get_mut(&token) {
            state.in_flight_or_consumed = false;
        }
    }

    /// Consumes a PUSH token outright on success, or releases it on failure so a
    /// retried PUSH can still use it (§4.4: "Mismatch -> ... token not consumed").
    async fn finish_push(&self, token: TokenValue, succeeded: bool) {
        let mut tokens = self.tokens.lock().await;
        if succeeded {
            tokens.remove(&token);
        } else if let Some(state) = tokens.get_mut(&token) {
            state.in_flight_or_consumed = false;
        }
    }
}

/// Reads the length-prefixed JSON control frame that opens every data-channel
/// connection: a 4-byte big-endian length followed by that many bytes of JSON.
async fn read_control_frame(stream: &mut (impl AsyncRead + Unpin)) -> Result<ControlFrame, DataChannelError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

async fn write_control_frame(stream: &mut (impl AsyncWrite + Unpin), frame: &ControlFrame) -> Result<(), DataChannelError> {
    let body = serde_json::to_vec(frame)?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

/// Client side: opens `stream`, sends the control frame, and for PUSH writes `data`,
/// verifying it round-trips without error (the server performs the authoritative hash
/// check; this only surfaces transport-level failure).
pub async fn push(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    token: TokenValue,
    hash: [u8; 20],
    data: &[u8],
) -> Result<(), DataChannelError> {
    write_control_frame(&mut stream, &ControlFrame { token, hash, operation: Operation::Push }).await?;
    stream.write_all(data).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Client side: opens `stream`, sends the control frame, and reads back the shard
/// bytes in full.
pub async fn pull(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    token: TokenValue,
    hash: [u8; 20],
) -> Result<Vec<u8>, DataChannelError> {
    write_control_frame(&mut stream, &ControlFrame { token, hash, operation: Operation::Pull }).await?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}

/// Server side: services one inbound data-channel connection end to end. Intended to
/// be spawned per accepted connection; tolerates many concurrent calls against the
/// same `registry`/`storage` (§4.4's concurrency requirement), serialized only by each
/// token's own in-flight reservation.
pub async fn serve_connection(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    registry: &TokenRegistry,
    storage: &dyn StorageAdapter,
) -> Result<(), DataChannelError> {
    let frame = read_control_frame(&mut stream).await?;
    registry.reserve(&frame).await?;

    let result = match frame.operation {
        Operation::Push => handle_push(&mut stream, registry, storage, &frame).await,
        Operation::Pull => handle_pull(&mut stream, storage, &frame).await,
    };

    if frame.operation == Operation::Pull {
        registry.release(frame.token).await;
    }
    result
}

async fn handle_push(
    stream: &mut (impl AsyncRead + Unpin),
    registry: &TokenRegistry,
    storage: &dyn StorageAdapter,
    frame: &ControlFrame,
) -> Result<(), DataChannelError> {
    let key = ShardHash::from_hex(&hex::encode(frame.hash)).expect("20-byte hash is always valid hex");
    let mut sink = storage.open_write(&key).await?;
    let mut hasher = PushHasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tokio::io::AsyncWriteExt::write_all(&mut sink, &buf[..n]).await?;
    }
    tokio::io::AsyncWriteExt::shutdown(&mut sink).await?;

    let computed = hasher.finalize();
    if computed != frame.hash {
        storage.del(&key).await?;
        registry.finish_push(frame.token, false).await;
        return Err(DataChannelError::HashMismatch);
    }
    registry.finish_push(frame.token, true).await;
    Ok(())
}

async fn handle_pull(
    stream: &mut (impl AsyncWrite + Unpin),
    storage: &dyn StorageAdapter,
    frame: &ControlFrame,
) -> Result<(), DataChannelError> {
    let key = ShardHash::from_hex(&hex::encode(frame.hash)).expect("20-byte hash is always valid hex");
    let item = storage.get(&key).await?;
    let ShardBody::Readable(mut reader) = item.shard else {
        return Err(DataChannelError::ContractUnknown);
    };
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Streaming `RIPEMD160(SHA256(·))`, matching the digest every other crate on the
/// overlay uses for shard identity.
struct PushHasher(sha2::Sha256);

impl PushHasher {
    fn new() -> Self {
        Self(sha2::Sha256::new())
    }

    fn update(&mut self, chunk: &[u8]) {
        use sha2::Digest;
        self.0.update(chunk);
    }

    fn finalize(self) -> [u8; 20] {
        use ripemd::Ripemd160;
        use sha2::Digest;
        let sha = self.0.finalize();
        Ripemd160::digest(sha).into()
    }
}

#[cfg(test)]
mod tests {
    use storj_crypto::KeyPair;
    use storj_storage::memory::MemoryAdapter;
    use storj_storage::ItemMeta;
    use tokio::io::duplex;

    use super::*;

    fn shard_hash(data: &[u8]) -> [u8; 20] {
        storj_crypto::hash160(data)
    }

    /// Scenario S5.
    #[tokio::test]
    async fn scenario_s5_push_then_retrieve_then_reject_replay() {
        let registry = TokenRegistry::new();
        let storage = MemoryAdapter::new();
        let farmer = KeyPair::generate().node_id();
        let data = b"hello storj";
        let hash = shard_hash(data);
        let key = ShardHash::from_hex(&hex::encode(hash)).unwrap();
        storage.put(&key, ItemMeta::new(key)).await.unwrap();

        let token = registry.issue_push(hash, farmer, Duration::from_secs(300)).await;

        let (client, server) = duplex(4096);
        let server_task = tokio::spawn({
            let registry = registry.clone();
            let storage = storage.clone();
            async move { serve_connection(server, &registry, &storage).await }
        });
        push(client, token, hash, data).await.unwrap();
        server_task.await.unwrap().unwrap();

        let item = storage.get(&key).await.unwrap();
        let ShardBody::Readable(mut reader) = item.shard else { panic!("shard should be persisted") };
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, data);

        // Second use of the same (now-consumed) token must fail.
        let (client2, server2) = duplex(4096);
        let server_task2 = tokio::spawn({
            let registry = registry.clone();
            let storage = storage.clone();
            async move { serve_connection(server2, &registry, &storage).await }
        });
        push(client2, token, hash, data).await.unwrap();
        let err = server_task2.await.unwrap().unwrap_err();
        assert!(matches!(err, DataChannelError::InvalidToken));
    }

    #[tokio::test]
    async fn push_hash_mismatch_discards_shard_and_keeps_token_usable() {
        let registry = TokenRegistry::new();
        let storage = MemoryAdapter::new();
        let farmer = KeyPair::generate().node_id();
        let hash = shard_hash(b"expected bytes");
        let key = ShardHash::from_hex(&hex::encode(hash)).unwrap();
        storage.put(&key, ItemMeta::new(key)).await.unwrap();
        let token = registry.issue_push(hash, farmer, Duration::from_secs(300)).await;

        let (client, server) = duplex(4096);
        let server_task = tokio::spawn({
            let registry = registry.clone();
            let storage = storage.clone();
            async move { serve_connection(server, &registry, &storage).await }
        });
        push(client, token, hash, b"wrong bytes").await.unwrap();
        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, DataChannelError::HashMismatch));

        // Token was not consumed: a correct retry on the same token succeeds.
        let (client2, server2) = duplex(4096);
        let server_task2 = tokio::spawn({
            let registry = registry.clone();
            let storage = storage.clone();
            async move { serve_connection(server2, &registry, &storage).await }
        });
        push(client2, token, hash, b"expected bytes").await.unwrap();
        server_task2.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pull_token_is_reusable_within_ttl() {
        let registry = TokenRegistry::new();
        let storage = MemoryAdapter::new();
        let farmer = KeyPair::generate().node_id();
        let data = b"pullable shard";
        let hash = shard_hash(data);
        let key = ShardHash::from_hex(&hex::encode(hash)).unwrap();
        storage.put(&key, ItemMeta::new(key)).await.unwrap();
        let mut sink = storage.open_write(&key).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut sink, data).await.unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut sink).await.unwrap();

        let token = registry.issue_pull(hash, farmer, Duration::from_secs(300)).await;

        for _ in 0..2 {
            let (client, server) = duplex(4096);
            let server_task = tokio::spawn({
                let registry = registry.clone();
                let storage = storage.clone();
                async move { serve_connection(server, &registry, &storage).await }
            });
            let received = pull(client, token, hash).await.unwrap();
            server_task.await.unwrap().unwrap();
            assert_eq!(received, data);
        }
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let registry = TokenRegistry::new();
        let storage = MemoryAdapter::new();
        let farmer = KeyPair::generate().node_id();
        let hash = shard_hash(b"data");
        let token = registry.issue_push(hash, farmer, Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (client, server) = duplex(4096);
        let server_task =
            tokio::spawn(async move { serve_connection(server, &registry, &storage).await });
        push(client, token, hash, b"data").await.unwrap();
        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, DataChannelError::TokenExpired));
    }
}
