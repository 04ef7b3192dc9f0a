//! Document stores.
//!
//! Every access goes through a [`PartitionedStore`], which routes the
//! business key and time of a document to one physical database per
//! partition. Databases are opened from a [`StoreBackend`] and named
//! `<logical name>-<shard>-<epoch>`.

use crate::error::StoreError;
use crate::partition::{Operation, Partition, PartitionRouter};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{event, Level};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: String,
    pub rev: u64,
    pub body: Value,
}

/// Condition a write must satisfy to be applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Precondition {
    /// Unconditional upsert.
    Any,
    /// The document must not exist yet.
    Absent,
    /// The stored document must still be at this revision.
    Revision(u64),
}

#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError>;

    /// Writes a document and returns its new revision. A failed
    /// precondition is a [`StoreError::Conflict`].
    async fn put(&self, id: &str, body: Value, precondition: Precondition) -> Result<u64, StoreError>;

    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Documents with ids between `start` and `end` inclusive, descending
    /// when `start > end`.
    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<StoredDoc>, StoreError>;
}

/// In process store, also used as the test double of real databases.
pub struct MemoryStore {
    name: String,
    docs: RwLock<BTreeMap<String, StoredDoc>>,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        Ok(self.docs.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, body: Value, precondition: Precondition) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().await;
        let current = docs.get(id).map(|d| d.rev);
        let ok = match precondition {
            Precondition::Any => true,
            Precondition::Absent => current.is_none(),
            Precondition::Revision(rev) => current == Some(rev),
        };
        if !ok {
            return Err(StoreError::Conflict { id: id.to_string() });
        }
        let rev = current.unwrap_or(0) + 1;
        docs.insert(
            id.to_string(),
            StoredDoc {
                id: id.to_string(),
                rev,
                body,
            },
        );
        Ok(rev)
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.docs.write().await.remove(id).is_some())
    }

    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<StoredDoc>, StoreError> {
        let docs = self.docs.read().await;
        let selected: Vec<StoredDoc> = if start <= end {
            docs.range(start.to_string()..=end.to_string())
                .skip(skip)
                .take(limit)
                .map(|(_, d)| d.clone())
                .collect()
        } else {
            docs.range(end.to_string()..=start.to_string())
                .rev()
                .skip(skip)
                .take(limit)
                .map(|(_, d)| d.clone())
                .collect()
        };
        Ok(selected)
    }
}

/// Where a logical store lives.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct StoreAddress {
    pub server_uri: String,
    pub logical_name: String,
}

impl StoreAddress {
    pub fn new(server_uri: &str, logical_name: &str) -> Self {
        Self {
            server_uri: server_uri.to_string(),
            logical_name: logical_name.to_string(),
        }
    }

    pub fn db_name(&self, partition: Partition) -> String {
        format!("{}-{}-{}", self.logical_name, partition.shard, partition.epoch)
    }
}

/// Opens physical databases.
pub trait StoreBackend: Send + Sync {
    fn open(&self, server_uri: &str, db_name: &str) -> Arc<dyn Store>;
}

/// Backend keeping every database in memory. Opening the same database
/// twice returns the same store.
#[derive(Default)]
pub struct MemoryBackend {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the databases opened so far.
    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl StoreBackend for MemoryBackend {
    fn open(&self, server_uri: &str, db_name: &str) -> Arc<dyn Store> {
        let name = format!("{}/{}", server_uri, db_name);
        let store = self
            .stores
            .entry(name.clone())
            .or_insert_with(|| Arc::new(MemoryStore::new(&name)))
            .clone();
        store
    }
}

/// A logical store spread over partitions.
pub struct PartitionedStore {
    address: StoreAddress,
    router: PartitionRouter,
    backend: Arc<dyn StoreBackend>,
}

impl PartitionedStore {
    pub fn new(address: StoreAddress, router: PartitionRouter, backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            address,
            router,
            backend,
        }
    }

    pub fn address(&self) -> &StoreAddress {
        &self.address
    }

    fn open(&self, partition: Partition) -> Arc<dyn Store> {
        self.backend
            .open(&self.address.server_uri, &self.address.db_name(partition))
    }

    fn single(&self, key: &str, time: i64, operation: Operation) -> Result<Arc<dyn Store>, StoreError> {
        let partitions = self.router.resolve(Some(key), time, operation)?;
        let partition = partitions
            .first()
            .copied()
            .ok_or(crate::error::PartitionError::MissingKey)?;
        Ok(self.open(partition))
    }

    pub async fn get(&self, key: &str, time: i64, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        self.single(key, time, Operation::Read)?.get(id).await
    }

    pub async fn put(
        &self,
        key: &str,
        time: i64,
        id: &str,
        body: Value,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        let store = self.single(key, time, Operation::Write)?;
        event!(Level::DEBUG, store = store.name(), id, "Writing document");
        store.put(id, body, precondition).await
    }

    pub async fn remove(&self, key: &str, time: i64, id: &str) -> Result<bool, StoreError> {
        self.single(key, time, Operation::Write)?.remove(id).await
    }

    /// Documents with ids in `[start_id, end_id]` from every partition
    /// covering `[from, to]`. Without a key every shard is read. Results
    /// are ordered by id in the direction of the id range.
    #[allow(clippy::too_many_arguments)]
    pub async fn range(
        &self,
        key: Option<&str>,
        from: i64,
        to: i64,
        start_id: &str,
        end_id: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<StoredDoc>, StoreError> {
        let partitions = self.router.balance(key, from, to, Operation::Read)?;
        let wanted = limit.saturating_add(skip);
        let mut docs = Vec::new();
        for partition in partitions {
            let store = self.open(partition);
            docs.extend(store.range(start_id, end_id, wanted, 0).await?);
        }
        if start_id <= end_id {
            docs.sort_by(|a, b| a.id.cmp(&b.id));
        } else {
            docs.sort_by(|a, b| b.id.cmp(&a.id));
        }
        Ok(docs.into_iter().skip(skip).take(limit).collect())
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        time: i64,
        id: &str,
    ) -> Result<Option<(T, u64)>, StoreError> {
        match self.get(key, time, id).await? {
            Some(doc) => Ok(Some((serde_json::from_value(doc.body)?, doc.rev))),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        time: i64,
        id: &str,
        body: &T,
        precondition: Precondition,
    ) -> Result<u64, StoreError> {
        self.put(key, time, id, serde_json::to_value(body)?, precondition)
            .await
    }
}
