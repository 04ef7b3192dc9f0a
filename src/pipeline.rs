//! The metering pipeline applied to every collected document.
//!
//! Everything a document changes is computed in memory first, so a
//! business error never leaves a partial write behind. Writes then go
//! hierarchy nodes first, instance state second, output record and
//! carry-over entry last. Each write is marked with the id of the
//! collected document, so a retry after a crash at any point completes the
//! missing writes without applying the document twice. A node whose marker
//! for an instance is neither the current nor the previous document of
//! that instance is ahead of the stored state, and the fold is refused as
//! a conflict until the missing state write lands.

use crate::accumulator::{AccumulatedUsage, Accumulator};
use crate::aggregator::{ancestors, node_id, AggregatedUsage, Aggregator, HierarchyLevel};
use crate::carryover::CarryOverLedger;
use crate::consumer::{Handled, UsageHandler};
use crate::dedup::DedupGuard;
use crate::docid::SeqId;
use crate::error::{MeteringError, PartitionError, StoreError};
use crate::lock::KeyedLocks;
use crate::partition::{PartitionRouter, StoreKind};
use crate::plan::{PlanProvider, ResolvedPlans};
use crate::store::{PartitionedStore, Precondition, StoreAddress, StoreBackend};
use crate::timewindow::Clock;
use crate::usage::{Envelope, UsageDocument};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{event, Level};

/// State stores keep a single epoch, so any valid time routes a key the
/// same way.
const STATE_TIME: i64 = 0;

/// Every store the pipeline reads or writes.
pub struct MeteringStores {
    pub accumulated: Arc<PartitionedStore>,
    pub aggregated: Arc<PartitionedStore>,
    pub output: Arc<PartitionedStore>,
    pub carry_over: Arc<PartitionedStore>,
    pub errors: Arc<PartitionedStore>,
}

impl MeteringStores {
    pub fn open(
        backend: Arc<dyn StoreBackend>,
        server_uri: &str,
        shards: u32,
    ) -> Result<MeteringStores, PartitionError> {
        let store = |name: &str, kind: StoreKind| -> Result<Arc<PartitionedStore>, PartitionError> {
            Ok(Arc::new(PartitionedStore::new(
                StoreAddress::new(server_uri, name),
                PartitionRouter::new(shards, kind)?,
                backend.clone(),
            )))
        };
        Ok(MeteringStores {
            accumulated: store("abacus-accumulator-accumulated-usage", StoreKind::State)?,
            aggregated: store("abacus-aggregator-aggregated-usage", StoreKind::State)?,
            output: store("abacus-accumulator-collected-usage", StoreKind::Log)?,
            carry_over: store("abacus-carry-over", StoreKind::Log)?,
            errors: store("abacus-business-errors", StoreKind::Log)?,
        })
    }
}

/// Id of the accumulated state of a resource instance.
pub fn state_id(instance_key: &str) -> String {
    format!("k/instance/{}", instance_key)
}

pub struct MeteringPipeline<P> {
    plans: P,
    accumulator: Accumulator,
    aggregator: Aggregator,
    accumulated: Arc<PartitionedStore>,
    aggregated: Arc<PartitionedStore>,
    dedup: DedupGuard,
    ledger: CarryOverLedger,
    locks: KeyedLocks,
    ids: SeqId,
    clock: Arc<dyn Clock>,
}

impl<P: PlanProvider> MeteringPipeline<P> {
    pub fn new(
        plans: P,
        accumulator: Accumulator,
        stores: &MeteringStores,
        clock: Arc<dyn Clock>,
    ) -> Self {
        MeteringPipeline {
            plans,
            accumulator,
            aggregator: Aggregator,
            accumulated: stores.accumulated.clone(),
            aggregated: stores.aggregated.clone(),
            dedup: DedupGuard::new(stores.output.clone(), 10_000, Duration::from_secs(3600)),
            ledger: CarryOverLedger::new(stores.carry_over.clone()),
            locks: KeyedLocks::new(),
            ids: SeqId::new(),
            clock,
        }
    }

    pub fn with_dedup_cache(mut self, size: usize, ttl: Duration) -> Self {
        let output = self.dedup.output().clone();
        self.dedup = DedupGuard::new(output, size, ttl);
        self
    }

    pub fn ledger(&self) -> &CarryOverLedger {
        &self.ledger
    }

    pub async fn accumulated(&self, usage: &UsageDocument) -> Result<Option<AccumulatedUsage>, StoreError> {
        let key = usage.instance_key();
        Ok(self
            .accumulated
            .get_json(&key, usage.end, &state_id(&key))
            .await?
            .map(|(state, _)| state))
    }

    pub async fn node(&self, level: HierarchyLevel, key: &str) -> Result<Option<AggregatedUsage>, StoreError> {
        let id = node_id(level, key);
        Ok(self
            .aggregated
            .get_json(&id, STATE_TIME, &id)
            .await?
            .map(|(node, _)| node))
    }

    /// Applies one collected document.
    pub async fn apply(&self, usage: &UsageDocument) -> Result<Handled, MeteringError> {
        usage.validate()?;
        if self.dedup.is_duplicate(usage).await? {
            return Ok(Handled::Duplicate);
        }

        let instance_key = usage.instance_key();
        let _instance = self.locks.lock(&state_id(&instance_key)).await;
        // Another delivery of the same document may have finished while
        // this one waited for the lock.
        if self.dedup.is_duplicate(usage).await? || self.ledger.is_applied(usage).await? {
            return Ok(Handled::Duplicate);
        }

        let usage_id = usage.usage_id();
        let id = state_id(&instance_key);
        let stored = self
            .accumulated
            .get_json::<AccumulatedUsage>(&instance_key, usage.end, &id)
            .await?;

        let current = match stored {
            Some((state, _)) if state.collected_usage_id == usage_id => {
                event!(Level::DEBUG, id = usage_id.as_str(), "Completing a partially applied usage");
                state
            }
            stored => {
                let plans = self
                    .plans
                    .resolve(&usage.resource_id, &usage.plan_id, usage.end)
                    .await?;
                let metered = plans.metering.meter(usage)?;
                let previous = stored.as_ref().map(|(state, _)| state);
                let processed = previous
                    .map(|p| p.processed)
                    .unwrap_or(i64::MIN)
                    .max(self.clock.now());
                let current = self.accumulator.accumulate(
                    previous,
                    usage,
                    &metered,
                    &plans,
                    processed,
                    self.ids.next(processed),
                )?;

                self.fold_ancestors(previous, &current, &plans).await?;

                let precondition = match &stored {
                    Some((_, rev)) => Precondition::Revision(*rev),
                    None => Precondition::Absent,
                };
                self.accumulated
                    .put_json(&instance_key, usage.end, &id, &current, precondition)
                    .await?;
                current
            }
        };

        self.dedup.record(usage, &current).await?;
        self.ledger.write(usage, current.processed).await?;
        event!(
            Level::DEBUG,
            id = usage_id.as_str(),
            processed_id = current.processed_id.as_str(),
            "Usage applied"
        );
        Ok(Handled::Applied)
    }

    async fn fold_ancestors(
        &self,
        previous: Option<&AccumulatedUsage>,
        current: &AccumulatedUsage,
        plans: &ResolvedPlans,
    ) -> Result<(), MeteringError> {
        let targets = ancestors(current);
        let ids: Vec<String> = targets
            .iter()
            .map(|(level, key)| node_id(*level, key))
            .collect();
        let _nodes = self.locks.lock_all(&ids).await;

        let instance = current.instance_key();
        let mut updates = Vec::with_capacity(targets.len());
        for ((level, key), id) in targets.iter().zip(&ids) {
            let (mut node, precondition) = match self
                .aggregated
                .get_json::<AggregatedUsage>(id, STATE_TIME, id)
                .await?
            {
                Some((node, rev)) => (node, Precondition::Revision(rev)),
                None => (AggregatedUsage::new(*level, key), Precondition::Absent),
            };
            match node.child_marker(&instance) {
                Some(marker) if marker == current.collected_usage_id => continue,
                // The node already holds a change of this instance that its
                // state never recorded. Folding on top of it would count
                // that change twice, so wait for its redelivery to land.
                Some(marker) if Some(marker) != previous.map(|p| p.collected_usage_id.as_str()) => {
                    event!(
                        Level::WARN,
                        node = id.as_str(),
                        instance = instance.as_str(),
                        marker,
                        "Node is ahead of the instance state"
                    );
                    return Err(StoreError::Conflict { id: id.clone() }.into());
                }
                _ => {}
            }
            self.aggregator.fold(&mut node, previous, current, plans)?;
            updates.push((id, node, precondition));
        }

        for (id, node, precondition) in updates {
            self.aggregated
                .put_json(id, STATE_TIME, id, &node, precondition)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: PlanProvider> UsageHandler for MeteringPipeline<P> {
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, MeteringError> {
        self.apply(&envelope.usage_doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{ErrorIsolation, ErrorStore};
    use crate::plan::{memory_plan, storage_plan, AccumulateFormula, Quantity, StaticPlanProvider, TimeBasedQuantity};
    use crate::error::ErrorClass;
    use crate::store::{MemoryBackend, Store, StoredDoc};
    use crate::timewindow::{FixedClock, Granularity};
    use crate::usage::{test_document, MeasuredUsage};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::task::JoinSet;

    const HOUR: i64 = 3600000;

    fn summing_plans() -> StaticPlanProvider {
        let mut plan = storage_plan();
        plan.metrics[0].accumulate = Some(AccumulateFormula::Sum);
        StaticPlanProvider::new().with_plan("object-storage", "basic", ResolvedPlans::new(plan))
    }

    fn open_pipeline(
        backend: Arc<MemoryBackend>,
        plans: StaticPlanProvider,
        clock: Arc<FixedClock>,
    ) -> (MeteringPipeline<StaticPlanProvider>, MeteringStores) {
        let stores = MeteringStores::open(backend, "memory://local", 4).unwrap();
        let pipeline = MeteringPipeline::new(plans, Accumulator::default(), &stores, clock);
        (pipeline, stores)
    }

    /// Fails the next instance state write with a revision conflict, as a
    /// concurrent writer in another process would.
    struct ConflictingBackend {
        inner: MemoryBackend,
        armed: Arc<AtomicBool>,
    }

    struct ConflictingStore {
        inner: Arc<dyn Store>,
        armed: Arc<AtomicBool>,
    }

    impl StoreBackend for ConflictingBackend {
        fn open(&self, server_uri: &str, db_name: &str) -> Arc<dyn Store> {
            Arc::new(ConflictingStore {
                inner: self.inner.open(server_uri, db_name),
                armed: self.armed.clone(),
            })
        }
    }

    #[async_trait]
    impl Store for ConflictingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
            self.inner.get(id).await
        }

        async fn put(&self, id: &str, body: Value, precondition: Precondition) -> Result<u64, StoreError> {
            if id.starts_with("k/instance/") && self.armed.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Conflict { id: id.to_string() });
            }
            self.inner.put(id, body, precondition).await
        }

        async fn remove(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.remove(id).await
        }

        async fn range(
            &self,
            start: &str,
            end: &str,
            limit: usize,
            skip: usize,
        ) -> Result<Vec<StoredDoc>, StoreError> {
            self.inner.range(start, end, limit, skip).await
        }
    }

    fn month_quantity(windows: Option<&crate::accumulator::MetricWindows>) -> Option<Quantity> {
        windows?.cells(Granularity::Month)[0]
            .as_ref()
            .map(|cell| cell.quantity)
    }

    async fn consumer_storage(pipeline: &MeteringPipeline<StaticPlanProvider>) -> Option<Quantity> {
        let node = pipeline
            .node(HierarchyLevel::Consumer, "org-1/space-1/app-1")
            .await
            .unwrap()?;
        let resource = node.resource("object-storage")?;
        month_quantity(resource.aggregated_usage.iter().find(|m| m.metric == "storage"))
    }

    #[tokio::test]
    async fn test_redelivery_is_applied_once() {
        let backend = Arc::new(MemoryBackend::new());
        let doc = test_document();
        let clock = Arc::new(FixedClock::new(doc.end + 1000));
        let (pipeline, _stores) = open_pipeline(backend.clone(), summing_plans(), clock.clone());
        let envelope = Envelope::new(doc.clone());

        assert_eq!(pipeline.handle(&envelope).await.unwrap(), Handled::Applied);
        assert_eq!(pipeline.handle(&envelope).await.unwrap(), Handled::Duplicate);

        let state = pipeline.accumulated(&doc).await.unwrap().unwrap();
        assert_eq!(month_quantity(state.metric("storage")), Some(Quantity::Number(1.0)));
        assert_eq!(consumer_storage(&pipeline).await, Some(Quantity::Number(1.0)));
        assert_eq!(pipeline.ledger().read_period(doc.end).await.unwrap().len(), 1);

        // A restarted process starts with an empty cache.
        let (restarted, _) = open_pipeline(backend, summing_plans(), clock);
        assert_eq!(restarted.handle(&envelope).await.unwrap(), Handled::Duplicate);
        assert_eq!(consumer_storage(&restarted).await, Some(Quantity::Number(1.0)));
    }

    #[tokio::test]
    async fn test_distinct_events_accumulate() {
        let backend = Arc::new(MemoryBackend::new());
        let doc = test_document();
        let clock = Arc::new(FixedClock::new(doc.end + 1000));
        let (pipeline, _stores) = open_pipeline(backend, summing_plans(), clock.clone());

        pipeline.apply(&doc).await.unwrap();
        let mut next = doc.clone();
        next.event_guid = Some("event-2".to_string());
        clock.set(doc.end + 2000);
        assert_eq!(pipeline.apply(&next).await.unwrap(), Handled::Applied);

        let state = pipeline.accumulated(&doc).await.unwrap().unwrap();
        assert_eq!(month_quantity(state.metric("storage")), Some(Quantity::Number(2.0)));
        assert_eq!(state.collected_usage_id, next.usage_id());
        assert_eq!(consumer_storage(&pipeline).await, Some(Quantity::Number(2.0)));

        let org = pipeline
            .node(HierarchyLevel::Organization, "org-1")
            .await
            .unwrap()
            .unwrap();
        let storage = org.resource("object-storage").unwrap();
        assert_eq!(
            month_quantity(storage.aggregated_usage.first()),
            Some(Quantity::Number(2.0))
        );
        assert_eq!(storage.plans[0].plan_id, "basic/basic/basic/basic");
        assert!(pipeline
            .node(HierarchyLevel::Account, "account-1")
            .await
            .unwrap()
            .is_some());

        // Only the latest event of the month is kept per instance.
        let entries = pipeline.ledger().read_period(doc.end).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_guid.as_deref(), Some("event-2"));
    }

    #[tokio::test]
    async fn test_partial_write_is_completed_once() {
        let backend = Arc::new(MemoryBackend::new());
        let doc = test_document();
        let clock = Arc::new(FixedClock::new(doc.end + 1000));
        let (pipeline, stores) = open_pipeline(backend.clone(), summing_plans(), clock.clone());
        pipeline.apply(&doc).await.unwrap();

        // Lose everything written after the instance state.
        assert!(stores
            .output
            .remove(&doc.instance_key(), doc.end, &doc.usage_id())
            .await
            .unwrap());
        assert!(stores
            .carry_over
            .remove(
                &doc.hierarchy_key(),
                crate::timewindow::truncate(doc.end, Granularity::Month),
                &CarryOverLedger::entry_id(&doc),
            )
            .await
            .unwrap());

        let (restarted, _) = open_pipeline(backend, summing_plans(), clock);
        assert_eq!(restarted.apply(&doc).await.unwrap(), Handled::Applied);
        let state = restarted.accumulated(&doc).await.unwrap().unwrap();
        assert_eq!(month_quantity(state.metric("storage")), Some(Quantity::Number(1.0)));
        assert_eq!(consumer_storage(&restarted).await, Some(Quantity::Number(1.0)));
        assert!(restarted.ledger().is_applied(&doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_scenario() {
        let t = 1420279200000; // 2015-01-03T10:00:00Z
        let mut doc = test_document();
        doc.plan_id = "standard".to_string();
        doc.start = t;
        doc.end = t;
        doc.measured_usage = vec![
            MeasuredUsage {
                measure: "current_instance_memory".to_string(),
                quantity: 2147483648.0,
            },
            MeasuredUsage {
                measure: "current_running_instances".to_string(),
                quantity: 2.0,
            },
            MeasuredUsage {
                measure: "previous_instance_memory".to_string(),
                quantity: 1073741824.0,
            },
            MeasuredUsage {
                measure: "previous_running_instances".to_string(),
                quantity: 1.0,
            },
        ];
        let plans = StaticPlanProvider::new().with_plan(
            "object-storage",
            "standard",
            ResolvedPlans::new(memory_plan()),
        );
        let clock = Arc::new(FixedClock::new(t + HOUR / 2));
        let (pipeline, _stores) = open_pipeline(Arc::new(MemoryBackend::new()), plans, clock);
        pipeline.apply(&doc).await.unwrap();

        let expected = Quantity::TimeBased(TimeBasedQuantity {
            consuming: 4.0,
            consumed: 3.0 * HOUR as f64,
            since: t,
        });
        let state = pipeline.accumulated(&doc).await.unwrap().unwrap();
        let hour = state.metric("memory").unwrap().cells(Granularity::Hour)[0]
            .as_ref()
            .unwrap()
            .quantity;
        assert_eq!(hour, expected);

        let space = pipeline
            .node(HierarchyLevel::Space, "org-1/space-1")
            .await
            .unwrap()
            .unwrap();
        let memory = &space.resource("object-storage").unwrap().aggregated_usage[0];
        assert_eq!(memory.cells(Granularity::Hour)[0].as_ref().unwrap().quantity, expected);
    }

    #[tokio::test]
    async fn test_business_error_is_diverted() {
        let doc = test_document();
        let clock = Arc::new(FixedClock::new(doc.end + 1000));
        let (pipeline, stores) = open_pipeline(
            Arc::new(MemoryBackend::new()),
            StaticPlanProvider::new(),
            clock.clone(),
        );
        let handler = ErrorIsolation::new(pipeline, ErrorStore::new(stores.errors.clone()), clock);

        let envelope = Envelope::new(doc.clone());
        assert_eq!(handler.handle(&envelope).await.unwrap(), Handled::Diverted);

        let errors = ErrorStore::new(stores.errors.clone());
        let entry = errors.get(&doc, doc.end + 1000).await.unwrap().unwrap();
        assert!(entry.error.contains("no metering plan basic"));
        assert!(handler.inner().accumulated(&doc).await.unwrap().is_none());
        assert!(!handler.inner().ledger().is_applied(&doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_state_write_is_not_counted_twice() {
        let armed = Arc::new(AtomicBool::new(true));
        let backend = Arc::new(ConflictingBackend {
            inner: MemoryBackend::new(),
            armed: armed.clone(),
        });
        let stores = MeteringStores::open(backend, "memory://local", 4).unwrap();
        let first = test_document();
        let clock = Arc::new(FixedClock::new(first.end + 1000));
        let pipeline = MeteringPipeline::new(summing_plans(), Accumulator::default(), &stores, clock.clone());

        // The nodes take the first document, its state write does not.
        let err = pipeline.apply(&first).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(!armed.load(Ordering::SeqCst));
        assert!(pipeline.accumulated(&first).await.unwrap().is_none());
        assert_eq!(consumer_storage(&pipeline).await, Some(Quantity::Number(1.0)));

        // Another document of the instance cannot fold on top of it.
        let mut second = first.clone();
        second.event_guid = Some("event-2".to_string());
        clock.set(first.end + 2000);
        let err = pipeline.apply(&second).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(consumer_storage(&pipeline).await, Some(Quantity::Number(1.0)));

        // The redelivered first document completes, then the second folds.
        assert_eq!(pipeline.apply(&first).await.unwrap(), Handled::Applied);
        assert_eq!(pipeline.apply(&second).await.unwrap(), Handled::Applied);
        let state = pipeline.accumulated(&first).await.unwrap().unwrap();
        assert_eq!(month_quantity(state.metric("storage")), Some(Quantity::Number(2.0)));
        assert_eq!(consumer_storage(&pipeline).await, Some(Quantity::Number(2.0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_events_of_one_instance() {
        let doc = test_document();
        let clock = Arc::new(FixedClock::new(doc.end + 1000));
        let (pipeline, _stores) = open_pipeline(Arc::new(MemoryBackend::new()), summing_plans(), clock);
        let pipeline = Arc::new(pipeline);

        let mut tasks = JoinSet::new();
        for event in 0..8 {
            let pipeline = pipeline.clone();
            let mut usage = doc.clone();
            usage.event_guid = Some(format!("event-{}", event));
            tasks.spawn(async move { pipeline.apply(&usage).await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap(), Handled::Applied);
        }

        let state = pipeline.accumulated(&doc).await.unwrap().unwrap();
        assert_eq!(month_quantity(state.metric("storage")), Some(Quantity::Number(8.0)));
        assert_eq!(consumer_storage(&pipeline).await, Some(Quantity::Number(8.0)));
        let org = pipeline
            .node(HierarchyLevel::Organization, "org-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            month_quantity(org.resource("object-storage").unwrap().aggregated_usage.first()),
            Some(Quantity::Number(8.0))
        );
    }

    #[tokio::test]
    async fn test_out_of_range_time_is_malformed() {
        let mut doc = test_document();
        doc.start = 10_000_000_000_000_000;
        doc.end = doc.start;
        let clock = Arc::new(FixedClock::new(1420243200000));
        let (pipeline, _stores) = open_pipeline(Arc::new(MemoryBackend::new()), summing_plans(), clock);

        let err = pipeline.apply(&doc).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Malformed);
        assert!(matches!(err, MeteringError::InvalidUsage(_)));
    }
}
