/// Partitioned key-value store, as consumed by the sync engine
///
/// The engine never computes partitions. It passes the record's affinity key on every `put`
/// and relies on the adapter to colocate records that share one. `partition_of` exists so the
/// colocation invariant can be checked from outside the store.
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::error::StoreError;
use crate::models::EntityRecord;

mod memory;

pub use memory::MemoryStore;

/// Reference to the parent record a child must share a partition with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AffinityKey {
    pub collection: &'static str,
    pub key: i64,
}

impl AffinityKey {
    pub fn new(collection: &'static str, key: i64) -> Self {
        Self { collection, key }
    }
}

impl fmt::Display for AffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Insert or fully overwrite the record stored under `key`
    async fn put(
        &self,
        collection: &str,
        key: i64,
        affinity: Option<AffinityKey>,
        record: EntityRecord,
    ) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: i64) -> Result<Option<EntityRecord>, StoreError>;

    /// Remove `key`; returns whether a record was present. Removing an absent key is not an error.
    async fn remove(&self, collection: &str, key: i64) -> Result<bool, StoreError>;

    async fn partition_of(&self, collection: &str, key: i64) -> Result<u32, StoreError>;

    async fn size(&self, collection: &str) -> Result<usize, StoreError>;

    /// Up to `limit` records ordered by key
    async fn list(&self, collection: &str, limit: usize) -> Result<Vec<EntityRecord>, StoreError>;
}
