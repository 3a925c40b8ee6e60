//! Mediates [`StorageAdapter`] access and applies the policy layer around it (§4.3's
//! "Shard manager" row): a size cap, per-key put serialization beyond what the adapter
//! itself guarantees, and sweeping of shards whose contracts have all expired or been
//! terminated.

use std::collections::HashMap;
use std::sync::Arc;

use storj_contract::Contract;
use storj_storage::{Item, ItemMeta, ShardHash, StorageAdapter, StorageError};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors raised by the shard manager's policy layer, layered on top of
/// [`StorageError`].
#[derive(Debug, Error)]
pub enum ShardManagerError {
    #[error("accepting {incoming} more bytes would exceed the {limit}-byte storage cap (currently at {used})")]
    StorageFull { incoming: u64, used: u64, limit: u64 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Wraps a [`StorageAdapter`] with a size cap and per-key locking for writes. Reads
/// pass straight through to the adapter (§5: "concurrent gets are permitted").
pub struct ShardManager {
    adapter: Arc<dyn StorageAdapter>,
    capacity_bytes: u64,
    /// One lock per shard key currently being written, so two concurrent `put`/`get`
    /// (write path) calls against the same key serialize even when the adapter alone
    /// wouldn't guarantee it.
    key_locks: Mutex<HashMap<ShardHash, Arc<Mutex<()>>>>,
}

impl ShardManager {
    pub fn new(adapter: Arc<dyn StorageAdapter>, capacity_bytes: u64) -> Self {
        Self { adapter, capacity_bytes, key_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, key: &ShardHash) -> Arc<Mutex<()>> {
        self.key_locks.lock().await.entry(*key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Reads straight through; concurrent reads are never serialized.
    pub async fn get(&self, key: &ShardHash) -> Result<Item, ShardManagerError> {
        Ok(self.adapter.get(key).await?)
    }

    pub async fn peek(&self, key: &ShardHash) -> Result<ItemMeta, ShardManagerError> {
        Ok(self.adapter.peek(key).await?)
    }

    /// Merges `item`'s metadata under `key`, rejecting the write if the shard's
    /// declared size would push total usage over [`Self::capacity_bytes`]. Only the
    /// incoming item's own `contracts` map is consulted for size, since a shard's
    /// `data_size` is fixed across every contract that references it.
    pub async fn put(&self, key: &ShardHash, item: ItemMeta) -> Result<(), ShardManagerError> {
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        if let Some(incoming) = item.contracts.values().next().map(Contract::data_size) {
            let already_have = self.adapter.peek(key).await.is_ok();
            if !already_have {
                let used = self.adapter.size().await?;
                if used + incoming > self.capacity_bytes {
                    return Err(ShardManagerError::StorageFull {
                        incoming,
                        used,
                        limit: self.capacity_bytes,
                    });
                }
            }
        }

        self.adapter.put(key, item).await?;
        Ok(())
    }

    pub async fn del(&self, key: &ShardHash) -> Result<(), ShardManagerError> {
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;
        self.adapter.del(key).await?;
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<ShardHash>, ShardManagerError> {
        Ok(self.adapter.keys().await?)
    }

    pub async fn size(&self) -> Result<u64, ShardManagerError> {
        Ok(self.adapter.size().await?)
    }

    /// Sweeps every stored shard and deletes any whose contracts are all either past
    /// `store_end` or explicitly terminated (§3's StorageItem lifecycle: "deleted when
    /// store_end passes or contract is explicitly terminated"). Returns the keys
    /// removed.
    pub async fn sweep_expired(&self, now_ms: u64) -> Result<Vec<ShardHash>, ShardManagerError> {
        let mut removed = Vec::new();
        for key in self.adapter.keys().await? {
            let meta = match self.adapter.peek(&key).await {
                Ok(meta) => meta,
                Err(StorageError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let all_expired = !meta.contracts.is_empty()
                && meta.contracts.values().all(|c| c.is_terminated() || c.store_end() <= now_ms);
            if all_expired {
                self.del(&key).await?;
                removed.push(key);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use storj_contract::{ContractFields, Role};
    use storj_crypto::KeyPair;
    use storj_storage::memory::MemoryAdapter;

    use super::*;

    fn key() -> ShardHash {
        ShardHash::from_hex(&"ab".repeat(20)).unwrap()
    }

    fn signed_contract(renter: &KeyPair, farmer: &KeyPair, store_end: u64) -> Contract {
        let mut contract = Contract::new(ContractFields {
            renter_id: renter.node_id(),
            renter_hd_key: None,
            farmer_id: farmer.node_id(),
            data_size: 11,
            data_hash: storj_crypto::hash160(b"hello storj"),
            store_begin: 0,
            store_end,
            audit_count: 4,
            payment_destination: "addr".to_owned(),
            payment_amount: 10,
        })
        .unwrap();
        contract.sign(renter, Role::Renter).unwrap();
        contract.sign(farmer, Role::Farmer).unwrap();
        contract
    }

    #[tokio::test]
    async fn put_over_capacity_is_rejected() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
        let manager = ShardManager::new(adapter, 5);
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();
        let contract = signed_contract(&renter, &farmer, 10_000);

        let key = key();
        let mut item = ItemMeta::new(key);
        item.contracts.insert(farmer.node_id(), contract);

        let err = manager.put(&key, item).await.unwrap_err();
        assert!(matches!(err, ShardManagerError::StorageFull { .. }));
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_shards_past_store_end() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryAdapter::new());
        let manager = ShardManager::new(adapter, 1_000_000);
        let renter = KeyPair::generate();
        let farmer = KeyPair::generate();

        let expired_key = ShardHash::from_hex(&"11".repeat(20)).unwrap();
        let mut expired_item = ItemMeta::new(expired_key);
        expired_item.contracts.insert(farmer.node_id(), signed_contract(&renter, &farmer, 100));
        manager.put(&expired_key, expired_item).await.unwrap();

        let active_key = ShardHash::from_hex(&"22".repeat(20)).unwrap();
        let mut active_item = ItemMeta::new(active_key);
        active_item.contracts.insert(farmer.node_id(), signed_contract(&renter, &farmer, 10_000_000_000));
        manager.put(&active_key, active_item).await.unwrap();

        let removed = manager.sweep_expired(5_000).await.unwrap();
        assert_eq!(removed, vec![expired_key]);
        assert!(manager.peek(&active_key).await.is_ok());
    }
}
