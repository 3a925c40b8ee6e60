//! Embedded-KV [`StorageAdapter`] on `libmdbx`: metadata and shard bytes live in two
//! tables of the same environment, keyed by the 20-byte shard hash. `libmdbx` is
//! synchronous, so every call here runs on a blocking-task via `tokio::task::spawn_blocking`
//! (the same pattern the teacher's storage crates use for blocking database calls).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libmdbx::{Database, NoWriteMap, TableFlags, WriteFlags};
use tokio::io::AsyncWrite;

use crate::{Item, ItemMeta, ShardBody, ShardHash, StorageAdapter, StorageError};

const META_TABLE: &str = "meta";
const SHARD_TABLE: &str = "shards";

/// A [`StorageAdapter`] backed by a single `libmdbx` environment with two tables.
/// Shard bytes are read/written as whole values (no streaming range reads), which is
/// adequate for the shard sizes this overlay uses (§4.5's default 8 MiB) but means a
/// `get`/`open_write` buffers the full shard in memory during the blocking call.
pub struct EmbeddedAdapter {
    db: Arc<Database<NoWriteMap>>,
}

impl EmbeddedAdapter {
    /// Opens (creating if necessary) an environment at `path` with the two tables this
    /// adapter needs.
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> Result<Self, StorageError> {
        let db = tokio::task::spawn_blocking(move || -> Result<Database<NoWriteMap>, StorageError> {
            let db = Database::<NoWriteMap>::open(path.as_ref())
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let txn = db.begin_rw_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            txn.create_table(Some(META_TABLE), TableFlags::CREATE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            txn.create_table(Some(SHARD_TABLE), TableFlags::CREATE)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            txn.commit().map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(db)
        })
        .await
        .expect("blocking open task panicked")?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn read_meta_bytes(&self, key: &ShardHash) -> Result<Option<Vec<u8>>, StorageError> {
        let db = self.db.clone();
        let key = *key;
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, StorageError> {
            let txn = db.begin_ro_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            let table =
                txn.open_table(Some(META_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            txn.get::<Vec<u8>>(&table, key.to_hex().as_bytes())
                .map_err(|e| StorageError::Database(e.to_string()))
        })
        .await
        .expect("blocking read task panicked")
    }

    async fn write_meta_bytes(&self, key: &ShardHash, bytes: Vec<u8>) -> Result<(), StorageError> {
        let db = self.db.clone();
        let key = *key;
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let txn = db.begin_rw_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            let table =
                txn.open_table(Some(META_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            txn.put(&table, key.to_hex().as_bytes(), &bytes, WriteFlags::UPSERT)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            txn.commit().map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(())
        })
        .await
        .expect("blocking write task panicked")
    }
}

#[async_trait]
impl StorageAdapter for EmbeddedAdapter {
    async fn get(&self, key: &ShardHash) -> Result<Item, StorageError> {
        let meta = self.peek(key).await?;
        let db = self.db.clone();
        let shard_key = *key;
        let shard_bytes = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, StorageError> {
            let txn = db.begin_ro_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            let table =
                txn.open_table(Some(SHARD_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            txn.get::<Vec<u8>>(&table, shard_key.to_hex().as_bytes())
                .map_err(|e| StorageError::Database(e.to_string()))
        })
        .await
        .expect("blocking read task panicked")?;

        let body = match shard_bytes {
            Some(bytes) => ShardBody::Readable(Box::pin(std::io::Cursor::new(bytes))),
            None => ShardBody::Writable(self.open_write(key).await?),
        };
        Ok(Item { meta, shard: body })
    }

    async fn peek(&self, key: &ShardHash) -> Result<ItemMeta, StorageError> {
        let bytes = self.read_meta_bytes(key).await?.ok_or_else(|| StorageError::NotFound(key.to_hex()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn put(&self, key: &ShardHash, item: ItemMeta) -> Result<(), StorageError> {
        if item.hash != *key {
            return Err(StorageError::HashMismatch);
        }
        let merged = match self.read_meta_bytes(key).await? {
            Some(existing) => {
                let mut existing: ItemMeta = serde_json::from_slice(&existing)?;
                existing.merge(item);
                existing
            }
            None => item,
        };
        self.write_meta_bytes(key, serde_json::to_vec(&merged)?).await
    }

    async fn open_write(&self, key: &ShardHash) -> Result<std::pin::Pin<Box<dyn AsyncWrite + Send>>, StorageError> {
        Ok(Box::pin(EmbeddedSink { db: self.db.clone(), key: *key, buf: Vec::new(), commit: None }))
    }

    async fn del(&self, key: &ShardHash) -> Result<(), StorageError> {
        let db = self.db.clone();
        let key = *key;
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let txn = db.begin_rw_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            let meta_table =
                txn.open_table(Some(META_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            let shard_table =
                txn.open_table(Some(SHARD_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            let _ = txn.del(&meta_table, key.to_hex().as_bytes(), None);
            let _ = txn.del(&shard_table, key.to_hex().as_bytes(), None);
            txn.commit().map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(())
        })
        .await
        .expect("blocking delete task panicked")
    }

    async fn keys(&self) -> Result<Vec<ShardHash>, StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ShardHash>, StorageError> {
            let txn = db.begin_ro_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            let table =
                txn.open_table(Some(META_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            let mut cursor = txn.cursor(&table).map_err(|e| StorageError::Database(e.to_string()))?;
            let mut out = Vec::new();
            for item in cursor.iter::<Vec<u8>, Vec<u8>>() {
                let (raw_key, _) = item.map_err(|e| StorageError::Database(e.to_string()))?;
                if let Ok(hex) = std::str::from_utf8(&raw_key) {
                    if let Ok(hash) = ShardHash::from_hex(hex) {
                        out.push(hash);
                    }
                }
            }
            Ok(out)
        })
        .await
        .expect("blocking iteration task panicked")
    }

    async fn size(&self) -> Result<u64, StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, StorageError> {
            let txn = db.begin_ro_txn().map_err(|e| StorageError::Database(e.to_string()))?;
            let table =
                txn.open_table(Some(SHARD_TABLE)).map_err(|e| StorageError::Database(e.to_string()))?;
            let mut cursor = txn.cursor(&table).map_err(|e| StorageError::Database(e.to_string()))?;
            let mut total = 0u64;
            for item in cursor.iter::<Vec<u8>, Vec<u8>>() {
                let (_, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
                total += value.len() as u64;
            }
            Ok(total)
        })
        .await
        .expect("blocking size task panicked")
    }
}

type CommitFuture = std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send>>;

/// Buffers shard bytes in memory and writes them as a single value on shutdown, since
/// `libmdbx` has no partial-value append API usable from a streaming writer.
struct EmbeddedSink {
    db: Arc<Database<NoWriteMap>>,
    key: ShardHash,
    buf: Vec<u8>,
    commit: Option<CommitFuture>,
}

impl AsyncWrite for EmbeddedSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.commit.is_none() {
            let db = this.db.clone();
            let key = this.key;
            let bytes = std::mem::take(&mut this.buf);
            this.commit = Some(Box::pin(async move {
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let txn = db
                        .begin_rw_txn()
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    let table = txn
                        .open_table(Some(SHARD_TABLE))
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    txn.put(&table, key.to_hex().as_bytes(), &bytes, WriteFlags::UPSERT)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    txn.commit().map_err(|e| std::io::Error::other(e.to_string()))?;
                    Ok(())
                })
                .await
                .expect("blocking commit task panicked")
            }));
        }
        match this.commit.as_mut().expect("just populated above").as_mut().poll(cx) {
            std::task::Poll::Ready(result) => std::task::Poll::Ready(result),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ShardHash {
        ShardHash::from_hex(&"ab".repeat(20)).unwrap()
    }

    async fn test_adapter() -> (EmbeddedAdapter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = EmbeddedAdapter::open(dir.path().to_path_buf()).await.unwrap();
        (adapter, dir)
    }

    #[tokio::test]
    async fn put_then_peek_round_trips_metadata() {
        let (adapter, _dir) = test_adapter().await;
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();
        let fetched = adapter.peek(&key).await.unwrap();
        assert_eq!(fetched.hash, key);
    }

    #[tokio::test]
    async fn open_write_then_get_reads_back_the_same_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (adapter, _dir) = test_adapter().await;
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();

        let mut sink = adapter.open_write(&key).await.unwrap();
        sink.write_all(b"hello storj").await.unwrap();
        sink.shutdown().await.unwrap();
        drop(sink);

        let item = adapter.get(&key).await.unwrap();
        let ShardBody::Readable(mut reader) = item.shard else {
            panic!("expected a readable shard body after open_write completed");
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello storj");
    }

    #[tokio::test]
    async fn del_removes_metadata_and_bytes() {
        let (adapter, _dir) = test_adapter().await;
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();
        adapter.del(&key).await.unwrap();
        assert!(matches!(adapter.peek(&key).await, Err(StorageError::NotFound(_))));
    }
}
