use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{AffinityKey, StoreAdapter};
use crate::error::StoreError;
use crate::models::{EntityKind, EntityRecord};

pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Longest affinity chain followed before giving up (guards against cycles)
const MAX_AFFINITY_DEPTH: usize = 8;

#[derive(Debug, Clone)]
struct StoredEntry {
    record: EntityRecord,
    affinity: Option<AffinityKey>,
}

/// In-process partitioned store
///
/// Placement follows the affinity chain: a record written with an affinity key lives in the
/// partition of the record it points at, and a record without one (or a key not yet written)
/// lives in the partition its own key hashes to. Placement is resolved when asked, so a child
/// written before its parent still ends up with the parent once both exist.
pub struct MemoryStore {
    partitions: u32,
    collections: HashMap<&'static str, DashMap<i64, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: u32) -> Self {
        let collections = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind.collection(), DashMap::new()))
            .collect();

        Self {
            partitions: partitions.max(1),
            collections,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn collection_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.collections.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn collection(&self, name: &str) -> Result<&DashMap<i64, StoredEntry>, StoreError> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    fn hash_partition(&self, key: i64) -> u32 {
        (fmix64(key as u64) % self.partitions as u64) as u32
    }

    fn resolve_partition(&self, collection: &str, key: i64) -> Result<u32, StoreError> {
        let mut current_collection = self.collection(collection)?;
        let mut current_key = key;

        for _ in 0..MAX_AFFINITY_DEPTH {
            let parent = current_collection
                .get(&current_key)
                .and_then(|entry| entry.affinity);

            match parent {
                Some(affinity) => {
                    current_collection = self.collection(affinity.collection)?;
                    current_key = affinity.key;
                }
                None => return Ok(self.hash_partition(current_key)),
            }
        }

        warn!(
            collection,
            key, "Affinity chain too deep, placing record by its last resolved key"
        );
        Ok(self.hash_partition(current_key))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn put(
        &self,
        collection: &str,
        key: i64,
        affinity: Option<AffinityKey>,
        record: EntityRecord,
    ) -> Result<(), StoreError> {
        let entries = self.collection(collection)?;
        if let Some(affinity) = affinity {
            self.collection(affinity.collection)?;
        }

        entries.insert(key, StoredEntry { record, affinity });
        debug!(collection, key, "Stored record");
        Ok(())
    }

    async fn get(&self, collection: &str, key: i64) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self
            .collection(collection)?
            .get(&key)
            .map(|entry| entry.record.clone()))
    }

    async fn remove(&self, collection: &str, key: i64) -> Result<bool, StoreError> {
        Ok(self.collection(collection)?.remove(&key).is_some())
    }

    async fn partition_of(&self, collection: &str, key: i64) -> Result<u32, StoreError> {
        self.resolve_partition(collection, key)
    }

    async fn size(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.collection(collection)?.len())
    }

    async fn list(&self, collection: &str, limit: usize) -> Result<Vec<EntityRecord>, StoreError> {
        let entries = self.collection(collection)?;
        let mut keys: Vec<i64> = entries.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();

        Ok(keys
            .into_iter()
            .filter_map(|key| entries.get(&key).map(|entry| entry.record.clone()))
            .take(limit)
            .collect())
    }
}

/// MurmurHash3 64-bit finalizer
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Customer, Order, OrderItem};

    fn customer(id: i64, name: &str) -> EntityRecord {
        Customer {
            id,
            name: Some(name.to_string()),
            email: None,
            city: None,
        }
        .into()
    }

    fn order(id: i64, customer_id: i64) -> EntityRecord {
        Order {
            id,
            customer_id,
            status: None,
            total: None,
            order_date: None,
        }
        .into()
    }

    fn item(id: i64, order_id: i64) -> EntityRecord {
        OrderItem {
            id,
            order_id,
            product_id: None,
            quantity: Some(1),
            unit_price: None,
        }
        .into()
    }

    async fn put(store: &MemoryStore, record: EntityRecord) {
        store
            .put(record.collection(), record.key(), record.affinity(), record)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_overwrites_and_remove_is_idempotent() {
        let store = MemoryStore::new();
        put(&store, customer(1, "Jo")).await;
        put(&store, customer(1, "Joe")).await;

        assert_eq!(store.size("customers").await.unwrap(), 1);
        assert_eq!(
            store.get("customers", 1).await.unwrap(),
            Some(customer(1, "Joe"))
        );

        assert!(store.remove("customers", 1).await.unwrap());
        assert!(!store.remove("customers", 1).await.unwrap());
        assert_eq!(store.get("customers", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_affinity_chain_colocates_transitively() {
        let store = MemoryStore::with_partitions(64);
        put(&store, customer(7, "Ana")).await;
        put(&store, order(1001, 7)).await;
        put(&store, item(50001, 1001)).await;

        let parent = store.partition_of("customers", 7).await.unwrap();
        assert_eq!(store.partition_of("orders", 1001).await.unwrap(), parent);
        assert_eq!(store.partition_of("order_items", 50001).await.unwrap(), parent);
    }

    #[tokio::test]
    async fn test_child_written_before_parent_is_colocated() {
        let store = MemoryStore::with_partitions(64);
        put(&store, item(9, 300)).await;
        put(&store, order(300, 42)).await;

        assert_eq!(
            store.partition_of("order_items", 9).await.unwrap(),
            store.partition_of("customers", 42).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let store = MemoryStore::new();
        assert_eq!(
            store.size("widgets").await,
            Err(StoreError::UnknownCollection("widgets".into()))
        );
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_limited() {
        let store = MemoryStore::new();
        for id in [3, 1, 2] {
            put(&store, customer(id, "x")).await;
        }

        let keys: Vec<i64> = store
            .list("customers", 2)
            .await
            .unwrap()
            .iter()
            .map(EntityRecord::key)
            .collect();
        assert_eq!(keys, vec![1, 2]);
    }
}
