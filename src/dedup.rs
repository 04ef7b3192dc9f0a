//! Duplicate detection for collected usage.
//!
//! The output store is authoritative: a document is a duplicate when its
//! output already exists there. A bounded cache in front of it avoids a
//! store round trip for recently seen documents, and is backfilled from
//! store hits, so a restarted process with an empty cache stays correct.

use crate::accumulator::AccumulatedUsage;
use crate::cache::TtlCache;
use crate::error::StoreError;
use crate::store::{PartitionedStore, Precondition};
use crate::usage::UsageDocument;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

pub struct DedupGuard {
    seen: TtlCache<String, ()>,
    output: Arc<PartitionedStore>,
}

impl DedupGuard {
    pub fn new(output: Arc<PartitionedStore>, cache_size: usize, cache_ttl: Duration) -> Self {
        Self {
            seen: TtlCache::new(cache_size, cache_ttl),
            output,
        }
    }

    pub fn output(&self) -> &Arc<PartitionedStore> {
        &self.output
    }

    pub async fn is_duplicate(&self, usage: &UsageDocument) -> Result<bool, StoreError> {
        let id = usage.usage_id();
        if self.seen.get(&id).await.is_some() {
            event!(Level::DEBUG, id = id.as_str(), "Duplicate found in cache");
            return Ok(true);
        }
        let found = self
            .output
            .get(&usage.instance_key(), usage.end, &id)
            .await?
            .is_some();
        if found {
            event!(Level::DEBUG, id = id.as_str(), "Duplicate found in output store");
            self.seen.insert(id, ()).await;
        }
        Ok(found)
    }

    /// Writes the output of a document, marking it as applied.
    pub async fn record(&self, usage: &UsageDocument, output: &AccumulatedUsage) -> Result<(), StoreError> {
        let id = usage.usage_id();
        self.output
            .put_json(&usage.instance_key(), usage.end, &id, output, Precondition::Any)
            .await?;
        self.seen.insert(id, ()).await;
        Ok(())
    }
}
