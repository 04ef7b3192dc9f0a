//! Carry-over ledger.
//!
//! Records, per resource instance and billing month, the last source event
//! applied to it. Entry ids are time prefixed so a month is a single range
//! scan, and the ledger of a new month starts empty.

use crate::docid::{pad16, tkuri};
use crate::error::StoreError;
use crate::store::{PartitionedStore, Precondition};
use crate::timewindow::{shift_time, truncate, Granularity};
use crate::usage::UsageDocument;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarryOverState {
    Started,
    /// The instance reported no memory in use anymore.
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarryOverEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_guid: Option<String>,
    pub state: CarryOverState,
    pub timestamp: i64,
}

pub struct CarryOverLedger {
    store: Arc<PartitionedStore>,
}

impl CarryOverLedger {
    pub fn new(store: Arc<PartitionedStore>) -> Self {
        Self { store }
    }

    fn month(usage: &UsageDocument) -> i64 {
        truncate(usage.end, Granularity::Month)
    }

    pub fn entry_id(usage: &UsageDocument) -> String {
        tkuri(&usage.hierarchy_key(), Self::month(usage))
    }

    fn state(usage: &UsageDocument) -> CarryOverState {
        let stopped = usage
            .measured_usage
            .iter()
            .any(|m| m.measure == "current_instance_memory" && m.quantity == 0.0);
        if stopped {
            CarryOverState::Stopped
        } else {
            CarryOverState::Started
        }
    }

    /// Records that `usage` has been fully applied at `processed`.
    pub async fn write(&self, usage: &UsageDocument, processed: i64) -> Result<CarryOverEntry, StoreError> {
        let month = Self::month(usage);
        let entry = CarryOverEntry {
            id: Self::entry_id(usage),
            collector_id: usage.collector_id.clone(),
            event_guid: usage.event_guid.clone(),
            state: Self::state(usage),
            timestamp: processed,
        };
        self.store
            .put_json(&usage.hierarchy_key(), month, &entry.id, &entry, Precondition::Any)
            .await?;
        event!(Level::DEBUG, id = entry.id.as_str(), state = ?entry.state, "Carry-over recorded");
        Ok(entry)
    }

    /// Whether this exact source event is the last one applied to its
    /// instance this month. Documents without a source id never match.
    pub async fn is_applied(&self, usage: &UsageDocument) -> Result<bool, StoreError> {
        if usage.source_id().is_none() {
            return Ok(false);
        }
        let entry = self
            .store
            .get_json::<CarryOverEntry>(&usage.hierarchy_key(), Self::month(usage), &Self::entry_id(usage))
            .await?;
        Ok(entry
            .map(|(entry, _)| {
                entry.event_guid == usage.event_guid && entry.collector_id == usage.collector_id
            })
            .unwrap_or(false))
    }

    /// Entries of the months starting in `[start, end]`, chronologically.
    pub async fn read_page(
        &self,
        start: i64,
        end: i64,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<CarryOverEntry>, StoreError> {
        let start_id = format!("t/{}", pad16(start));
        let end_id = format!("t/{}/{}", pad16(end), char::MAX);
        let docs = self
            .store
            .range(None, start, end, &start_id, &end_id, limit, skip)
            .await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc.body).map_err(StoreError::from))
            .collect()
    }

    /// Every entry of the billing month containing `time`.
    pub async fn read_period(&self, time: i64) -> Result<Vec<CarryOverEntry>, StoreError> {
        let month = truncate(time, Granularity::Month);
        let last = shift_time(month, Granularity::Month, 1) - 1;
        self.read_page(month, last, usize::MAX, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{PartitionRouter, StoreKind};
    use crate::store::{MemoryBackend, StoreAddress};
    use crate::usage::{test_document, MeasuredUsage};
    use chrono::{TimeZone, Utc};

    fn ledger() -> CarryOverLedger {
        CarryOverLedger::new(Arc::new(PartitionedStore::new(
            StoreAddress::new("memory://local", "abacus-carry-over"),
            PartitionRouter::new(4, StoreKind::Log).unwrap(),
            Arc::new(MemoryBackend::new()),
        )))
    }

    fn ms(y: i32, mo: u32, d: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0)
            .unwrap()
            .timestamp_millis()
    }

    #[tokio::test]
    async fn test_write_and_is_applied() {
        let ledger = ledger();
        let doc = test_document();
        assert!(!ledger.is_applied(&doc).await.unwrap());

        let entry = ledger.write(&doc, doc.end + 10).await.unwrap();
        assert_eq!(
            entry.id,
            "t/0001420070400000/k/org-1/space-1/app-1/object-storage/basic/instance-1"
        );
        assert_eq!(entry.state, CarryOverState::Started);
        assert!(ledger.is_applied(&doc).await.unwrap());

        let mut next = doc.clone();
        next.event_guid = Some("event-2".to_string());
        assert!(!ledger.is_applied(&next).await.unwrap());
    }

    #[tokio::test]
    async fn test_stopped_state() {
        let ledger = ledger();
        let mut doc = test_document();
        doc.measured_usage = vec![MeasuredUsage {
            measure: "current_instance_memory".to_string(),
            quantity: 0.0,
        }];
        let entry = ledger.write(&doc, doc.end).await.unwrap();
        assert_eq!(entry.state, CarryOverState::Stopped);
    }

    #[tokio::test]
    async fn test_read_period() {
        let ledger = ledger();
        for (instance, time) in [
            ("a", ms(2015, 1, 3)),
            ("b", ms(2015, 1, 20)),
            ("c", ms(2015, 2, 2)),
        ] {
            let mut doc = test_document();
            doc.resource_instance_id = instance.to_string();
            doc.start = time;
            doc.end = time;
            ledger.write(&doc, time).await.unwrap();
        }
        // Same instance again in January only updates its entry.
        let mut doc = test_document();
        doc.resource_instance_id = "a".to_string();
        doc.end = ms(2015, 1, 25);
        doc.event_guid = Some("event-2".to_string());
        ledger.write(&doc, doc.end).await.unwrap();

        let january = ledger.read_period(ms(2015, 1, 15)).await.unwrap();
        assert_eq!(january.len(), 2);
        assert!(january[0].id.ends_with("/a"));
        assert_eq!(january[0].event_guid.as_deref(), Some("event-2"));

        let february = ledger.read_period(ms(2015, 2, 28)).await.unwrap();
        assert_eq!(february.len(), 1);

        let page = ledger.read_page(ms(2015, 1, 1), ms(2015, 2, 1), 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].id.ends_with("/b"));
    }
}
