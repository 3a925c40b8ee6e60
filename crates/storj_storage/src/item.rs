//! [`ItemMeta`]: the non-shard-bytes half of a `StorageItem` (§3), and its merge-on-put
//! semantics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use storj_contract::Contract;
use storj_crypto::NodeId;
use storj_merkle::Challenge;

use crate::ShardHash;

/// The metadata half of a `StorageItem`: everything except the shard bytes themselves.
/// Every map is keyed by farmer — a shard may be stored (or have been stored in the
/// past) under more than one contract simultaneously, e.g. during a MIRROR handoff.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ItemMeta {
    pub hash: ShardHash,
    pub contracts: HashMap<NodeId, Contract>,
    pub trees: HashMap<NodeId, Vec<[u8; 20]>>,
    pub challenges: HashMap<NodeId, Vec<Challenge>>,
    pub meta: HashMap<NodeId, serde_json::Value>,
}

impl ItemMeta {
    pub fn new(hash: ShardHash) -> Self {
        Self { hash, ..Default::default() }
    }

    /// Unions `other`'s per-farmer maps into `self`, in place. Per §4.3's invariant,
    /// `put` followed by `get` must return a semantic superset — so merging never
    /// removes an existing farmer entry, only adds or overwrites its own.
    pub fn merge(&mut self, other: ItemMeta) {
        self.contracts.extend(other.contracts);
        self.trees.extend(other.trees);
        self.challenges.extend(other.challenges);
        self.meta.extend(other.meta);
    }
}
