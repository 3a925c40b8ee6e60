//! Abstract key -> (metadata, shard-bytes) store (§4.3), with three implementations:
//! an in-memory map ([`memory::MemoryAdapter`]), a filesystem directory-per-shard layout
//! ([`filesystem::FilesystemAdapter`]), and an embedded-KV store on `libmdbx`
//! ([`embedded::EmbeddedAdapter`]).
//!
//! The key is a [`ShardHash`] — the same 20-byte `RIPEMD160(SHA256(·))` digest used
//! everywhere else on the overlay, reused here rather than minting a parallel hash type.

pub mod embedded;
pub mod filesystem;
mod item;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use storj_crypto::NodeId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use item::ItemMeta;

/// The 20-byte content digest used as a storage key; structurally identical to a
/// [`NodeId`] (both are `RIPEMD160(SHA256(·))`), reused rather than duplicated.
pub type ShardHash = NodeId;

/// Errors raised by a [`StorageAdapter`] implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no record for shard {0}")]
    NotFound(String),
    #[error("shard bytes for {0} are not yet present")]
    ShardPending(String),
    #[error("the item's hash field does not match the lookup key")]
    HashMismatch,
    #[error("underlying I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("underlying database error: {0}")]
    Database(String),
    #[error("metadata (de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An item's shard bytes: either readable (already persisted) or writable (awaited, e.g.
/// a `StorageItem` created by CONSIGN before the PUSH data-channel transfer lands).
pub enum ShardBody {
    Readable(Pin<Box<dyn AsyncRead + Send>>),
    Writable(Pin<Box<dyn AsyncWrite + Send>>),
}

/// A full item as returned by [`StorageAdapter::get`]: metadata plus a shard-bytes
/// handle whose direction depends on whether bytes have been persisted yet.
pub struct Item {
    pub meta: ItemMeta,
    pub shard: ShardBody,
}

/// Summary statistics used by the network facade's monitoring surface (an additive,
/// non-load-bearing convenience — SPEC_FULL §4.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub key_count: u64,
    pub total_bytes: u64,
}

/// Abstract store mediating access to shard metadata and bytes (§4.3). All operations
/// are asynchronous; implementations must serialize concurrent `put`s to the same key
/// while permitting concurrent `get`s (§5).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Fetches full metadata plus a shard-bytes handle. `NotFound` if no record exists
    /// for `key` at all (not even metadata without bytes).
    async fn get(&self, key: &ShardHash) -> Result<Item, StorageError>;

    /// Fetches metadata only, without attaching a shard stream.
    async fn peek(&self, key: &ShardHash) -> Result<ItemMeta, StorageError>;

    /// Idempotent metadata merge: farmer-keyed maps (contracts/trees/challenges/meta)
    /// are unioned, never dropped (§4.3's invariant). Rejects a hash mismatch between
    /// `key` and `item.hash`.
    async fn put(&self, key: &ShardHash, item: ItemMeta) -> Result<(), StorageError>;

    /// Opens a sink to persist shard bytes for `key`. The adapter is responsible for
    /// making those bytes visible to subsequent `get`/`peek` calls once the sink is
    /// closed; callers (the data channel's PUSH handler) verify the content hash
    /// themselves before treating the transfer as committed.
    async fn open_write(&self, key: &ShardHash) -> Result<Pin<Box<dyn AsyncWrite + Send>>, StorageError>;

    /// Removes shard bytes. Metadata retention on delete is implementation-defined
    /// policy (§4.3); all three adapters here drop both.
    async fn del(&self, key: &ShardHash) -> Result<(), StorageError>;

    /// All keys with a valid 40-hex shape (anything else present in the backing store
    /// is ignored, e.g. a lock file or index structure).
    async fn keys(&self) -> Result<Vec<ShardHash>, StorageError>;

    /// Total bytes used by persisted shards.
    async fn size(&self) -> Result<u64, StorageError>;

    /// Convenience snapshot of `(key_count, total_bytes)`.
    async fn stats(&self) -> Result<AdapterStats, StorageError> {
        Ok(AdapterStats { key_count: self.keys().await?.len() as u64, total_bytes: self.size().await? })
    }
}
