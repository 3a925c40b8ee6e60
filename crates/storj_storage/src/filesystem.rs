//! Filesystem [`StorageAdapter`]: one directory per shard (named by its 40-hex key),
//! holding a `meta.json` (the [`ItemMeta`] minus the shard bytes) and a `shard.bin`
//! (the raw shard, present once a PUSH has completed).

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWrite;

use crate::{Item, ItemMeta, ShardBody, ShardHash, StorageAdapter, StorageError};

const META_FILE: &str = "meta.json";
const SHARD_FILE: &str = "shard.bin";

/// A [`StorageAdapter`] backed by a directory tree: `root/<40-hex-key>/{meta.json,shard.bin}`.
pub struct FilesystemAdapter {
    root: PathBuf,
}

impl FilesystemAdapter {
    /// Uses (creating if necessary) `root` as the adapter's storage directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn shard_dir(&self, key: &ShardHash) -> PathBuf {
        self.root.join(key.to_hex())
    }

    fn meta_path(&self, key: &ShardHash) -> PathBuf {
        self.shard_dir(key).join(META_FILE)
    }

    fn shard_path(&self, key: &ShardHash) -> PathBuf {
        self.shard_dir(key).join(SHARD_FILE)
    }

    async fn read_meta(&self, key: &ShardHash) -> Result<ItemMeta, StorageError> {
        let bytes = fs::read(self.meta_path(key))
            .await
            .map_err(|_| StorageError::NotFound(key.to_hex()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_meta(&self, key: &ShardHash, meta: &ItemMeta) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(meta)?;
        fs::write(self.meta_path(key), bytes).await?;
        Ok(())
    }
}

/// Every 40-hex directory name is a valid key; anything else under `root` (stray files,
/// partial writes from a crashed process) is ignored.
fn is_shard_key_name(name: &str) -> bool {
    name.len() == 40 && name.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl StorageAdapter for FilesystemAdapter {
    async fn get(&self, key: &ShardHash) -> Result<Item, StorageError> {
        let meta = self.read_meta(key).await?;
        let shard_path = self.shard_path(key);
        let body = if fs::try_exists(&shard_path).await? {
            let file = fs::File::open(&shard_path).await?;
            ShardBody::Readable(Box::pin(file))
        } else {
            let file = fs::File::create(&shard_path).await?;
            ShardBody::Writable(Box::pin(file))
        };
        Ok(Item { meta, shard: body })
    }

    async fn peek(&self, key: &ShardHash) -> Result<ItemMeta, StorageError> {
        self.read_meta(key).await
    }

    async fn put(&self, key: &ShardHash, item: ItemMeta) -> Result<(), StorageError> {
        if item.hash != *key {
            return Err(StorageError::HashMismatch);
        }
        fs::create_dir_all(self.shard_dir(key)).await?;
        let merged = match self.read_meta(key).await {
            Ok(mut existing) => {
                existing.merge(item);
                existing
            }
            Err(StorageError::NotFound(_)) => item,
            Err(err) => return Err(err),
        };
        self.write_meta(key, &merged).await
    }

    async fn open_write(&self, key: &ShardHash) -> Result<Pin<Box<dyn AsyncWrite + Send>>, StorageError> {
        fs::create_dir_all(self.shard_dir(key)).await?;
        let file = fs::File::create(self.shard_path(key)).await?;
        Ok(Box::pin(file))
    }

    async fn del(&self, key: &ShardHash) -> Result<(), StorageError> {
        let dir = self.shard_dir(key);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(dir).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<ShardHash>, StorageError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_shard_key_name(&name) {
                if let Ok(hash) = ShardHash::from_hex(&name) {
                    out.push(hash);
                }
            }
        }
        Ok(out)
    }

    async fn size(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for key in self.keys().await? {
            let path = self.shard_path(&key);
            if let Ok(metadata) = fs::metadata(&path).await {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

/// Test-only convenience: builds an adapter rooted at a fresh temp directory, returning
/// the [`tempfile::TempDir`] so the caller keeps it alive for the test's duration.
#[cfg(test)]
async fn test_adapter() -> (FilesystemAdapter, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let adapter = FilesystemAdapter::open(dir.path()).await.unwrap();
    (adapter, dir)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn key() -> ShardHash {
        ShardHash::from_hex(&"ab".repeat(20)).unwrap()
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
    async fn keys_ignores_non_hex_directory_names() {
        let (adapter, dir) = test_adapter().await;
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();
        fs::create_dir_all(dir.path().join("not-a-shard-key")).await.unwrap();

        let keys = adapter.keys().await.unwrap();
        assert_eq!(keys, vec![key]);
    }

    #[tokio::test]
    async fn del_removes_the_whole_shard_directory() {
        let (adapter, _dir) = test_adapter().await;
        let key = key();
        adapter.put(&key, ItemMeta::new(key)).await.unwrap();
        adapter.del(&key).await.unwrap();
        assert!(matches!(adapter.peek(&key).await, Err(StorageError::NotFound(_))));
    }
}
