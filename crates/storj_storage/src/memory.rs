//! In-memory [`StorageAdapter`]: two maps, keys -> metadata and keys -> shard bytes,
//! guarded by a single `tokio::sync::Mutex` each. Used in tests and by nodes that don't
//! persist shards across restarts.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::{Item, ItemMeta, ShardBody, ShardHash, StorageAdapter, StorageError};

/// An in-memory [`StorageAdapter`]. Cheap to clone: internally `Arc`-backed.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    meta: Arc<Mutex<HashMap<ShardHash, ItemMeta>>>,
    shards: Arc<Mutex<HashMap<ShardHash, Vec<u8>>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Writable sink that buffers bytes and commits them to the adapter's shard map on
/// `shutdown` (the point at which `AsyncWriteExt::flush`/drop-based closers settle).
type CommitFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

struct MemorySink {
    key: ShardHash,
    shards: Arc<Mutex<HashMap<ShardHash, Vec<u8>>>>,
    buf: Vec<u8>,
    commit: Option<CommitFuture>,
}

impl MemorySink {
    fn new(key: ShardHash, shards: Arc<Mutex<HashMap<ShardHash, Vec<u8>>>>) -> Self {
        Self { key, shards, buf: Vec::new(), commit: None }
    }
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.commit.is_none() {
            let shards = this.shards.clone();
            let key = this.key;
            let bytes = std::mem::take(&mut this.buf);
            this.commit = Some(Box::pin(async move {
                shards.lock().await.insert(key, bytes);
            }));
        }
        match this.commit.as_mut().expect("just populated above").as_mut().poll(cx) {
            std::task::Poll::Ready(()) => std::task::Poll::Ready(Ok(())),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn get(&self, key: &ShardHash) -> Result<Item, StorageError> {
        let meta = self.peek(key).await?;
        let shards = self.shards.lock().await;
        let body = match shards.get(key) {
            Some(bytes) => ShardBody::Readable(Box::pin(std::io::Cursor::new(bytes.clone()))),
            None => {
                ShardBody::Writable(Box::pin(MemorySink::new(*key, self.shards.clone())))
            }
        };
        Ok(Item { meta, shard: body })
    }

    async fn peek(&self, key: &ShardHash) -> Result<ItemMeta, StorageError> {
        self.meta.lock().await.get(key).cloned().ok_or_else(|| StorageError::NotFound(key.to_hex()))
    }

    async fn put(&self, key: &ShardHash, item: ItemMeta) -> Result<(), StorageError> {
        if item.hash != *key {
            return Err(StorageError::HashMismatch);
        }
        let mut meta = self.meta.lock().await;
        match meta.get_mut(key) {
            Some(existing) => existing.merge(item),
            None => {
                meta.insert(*key, item);
            }
        }
        Ok(())
    }

    async fn open_write(&self, key: &ShardHash) -> Result<Pin<Box<dyn AsyncWrite + Send>>, StorageError> {
        Ok(Box::pin(MemorySink::new(*key, self.shards.clone())))
    }

    async fn del(&self, key: &ShardHash) -> Result<(), StorageError> {
        self.shards.lock().await.remove(key);
        self.meta.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ShardHash>, StorageError> {
        Ok(self.meta.lock().await.keys().copied().collect())
    }

    async fn size(&self) -> Result<u64, StorageError> {
        Ok(self.shards.lock().await.values().map(|bytes| bytes.len() as u64).sum())
    }
}

#[cfg(test)]
mod tests {
    use storj_crypto::KeyPair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    use super::*;

    fn key() -> ShardHash {
        ShardHash::from_hex(&"ab".repeat(20)).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_returns_a_superset_of_input() {
        let adapter = MemoryAdapter::new();
        let key = key();
        let farmer = KeyPair::generate().node_id();
        let mut item = ItemMeta::new(key);
        item.trees.insert(farmer, vec![[1u8; 20]]);
        adapter.put(&key, item).await.unwrap();

        let fetched = adapter.peek(&key).await.unwrap();
        assert_eq!(fetched.hash, key);
        assert!(fetched.trees.contains_key(&farmer));
    }

    #[tokio::test]
    async fn put_rejects_hash_mismatch() {
        let adapter = MemoryAdapter::new();
        let key = key();
        let other = ShardHash::from_hex(&"cd".repeat(20)).unwrap();
        let err = adapter.put(&key, ItemMeta::new(other)).await.unwrap_err();
        assert!(matches!(err, StorageError::HashMismatch));
    }

    #[tokio::test]
    async fn get_before_any_bytes_yields_a_writable_sink() {
        let adapter = MemoryAdapter::new();
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();

        let item = adapter.get(&key).await.unwrap();
        let ShardBody::Writable(mut sink) = item.shard else {
            panic!("expected a writable shard body before any bytes arrive");
        };
        sink.write_all(b"hello storj").await.unwrap();
        sink.shutdown().await.unwrap();

        let item = adapter.get(&key).await.unwrap();
        let ShardBody::Readable(mut reader) = item.shard else {
            panic!("expected a readable shard body after the sink closed");
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello storj");
    }

    #[tokio::test]
    async fn del_removes_metadata_and_bytes() {
        let adapter = MemoryAdapter::new();
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();
        adapter.del(&key).await.unwrap();
        assert!(matches!(adapter.peek(&key).await, Err(StorageError::NotFound(_))));
    }
}
