//! Reliable queue consumption.
//!
//! Every delivery ends in exactly one of three ways: acknowledged, handed to
//! the next rung of the dead-letter ladder, or rejected once the ladder is
//! exhausted. A rung holds a message for its `ttl` and then puts it back on
//! the main exchange, so a failing message is retried with growing delays
//! and a bounded number of attempts.
//!
//! Kafka has no per-message TTL, so each rung is a topic drained by a
//! [`DeadLetterRelay`] that waits out the TTL before republishing. A
//! message handed on is acknowledged only once the broker confirmed the
//! republish; otherwise it is released for redelivery.

use crate::error::{ErrorClass, MeteringError};
use crate::producer::Publisher;
use crate::source::{Delivery, MessageSource};
use crate::timewindow::Clock;
use crate::usage::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{event, Level};

/// How a handler dealt with a message it did not fail on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Handled {
    Applied,
    /// Already applied by an earlier delivery.
    Duplicate,
    /// Recorded in the error store instead of being applied.
    Diverted,
}

#[async_trait]
pub trait UsageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, MeteringError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainQueueConfig {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub prefetch_limit: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterQueueConfig {
    pub name: String,
    pub exchange: String,
    pub main_exchange: String,
    pub routing_key: String,
    /// Milliseconds a message waits on this rung.
    pub ttl: u64,
    pub retry_attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTopology {
    pub main: MainQueueConfig,
    pub dead_letter_queues: Vec<DeadLetterQueueConfig>,
}

impl Default for QueueTopology {
    fn default() -> Self {
        let main_exchange = "main-queue-exchange".to_string();
        QueueTopology {
            main: MainQueueConfig {
                name: "abacus-collect-queue".to_string(),
                exchange: main_exchange.clone(),
                routing_key: "#".to_string(),
                prefetch_limit: 6,
            },
            dead_letter_queues: vec![
                DeadLetterQueueConfig {
                    name: "first-dl-queue".to_string(),
                    exchange: "first-dl-exchange".to_string(),
                    main_exchange: main_exchange.clone(),
                    routing_key: "#".to_string(),
                    ttl: 180_000,
                    retry_attempts: 100,
                },
                DeadLetterQueueConfig {
                    name: "second-dl-queue".to_string(),
                    exchange: "second-dl-exchange".to_string(),
                    main_exchange,
                    routing_key: "#".to_string(),
                    ttl: 1_620_000,
                    retry_attempts: 150,
                },
            ],
        }
    }
}

impl QueueTopology {
    /// The rung that takes a message which already failed `retry_count`
    /// times. Rungs are used in order, each for its own number of attempts.
    pub fn rung_for(&self, retry_count: u32) -> Option<(usize, &DeadLetterQueueConfig)> {
        let mut budget: u64 = 0;
        for (index, rung) in self.dead_letter_queues.iter().enumerate() {
            budget += u64::from(rung.retry_attempts);
            if u64::from(retry_count) < budget {
                return Some((index, rung));
            }
        }
        None
    }

    /// Total number of retries before a message is given up on.
    pub fn max_retries(&self) -> u64 {
        self.dead_letter_queues
            .iter()
            .map(|rung| u64::from(rung.retry_attempts))
            .sum()
    }
}

/// What happened to a delivery.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Acked(Handled),
    /// Could never be processed and was acknowledged without effect.
    Dropped,
    /// Handed to the given rung of the ladder.
    Retried { rung: usize },
    /// Failed on every rung and was rejected.
    Exhausted,
    /// Neither acknowledged nor handed over. Nothing past it is
    /// committed and the source delivers it again.
    Unacknowledged,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
}

impl ConsumerStats {
    fn count(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Acked(_) => &self.acked,
            Outcome::Dropped => &self.dropped,
            Outcome::Retried { .. } => &self.retried,
            Outcome::Exhausted => &self.exhausted,
            Outcome::Unacknowledged => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

/// Consumes the main queue with at most `prefetch_limit` deliveries in
/// flight.
pub struct ReliableConsumer<S, H> {
    source: S,
    publisher: Arc<dyn Publisher>,
    handler: H,
    topology: QueueTopology,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
    permits: Arc<Semaphore>,
    stats: ConsumerStats,
}

impl<S, H> ReliableConsumer<S, H>
where
    S: MessageSource + 'static,
    H: UsageHandler + 'static,
{
    pub fn new(
        source: S,
        publisher: Arc<dyn Publisher>,
        handler: H,
        topology: QueueTopology,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(topology.main.prefetch_limit.max(1)));
        ReliableConsumer {
            source,
            publisher,
            handler,
            topology,
            clock,
            conflict_retries: 3,
            permits,
            stats: ConsumerStats::default(),
        }
    }

    pub fn with_conflict_retries(mut self, conflict_retries: u32) -> Self {
        self.conflict_retries = conflict_retries;
        self
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Consumes until the source is drained, then waits for the
    /// deliveries still in flight.
    pub async fn run(self: Arc<Self>) {
        let prefetch = self.topology.main.prefetch_limit.max(1);
        event!(
            Level::INFO,
            queue = self.topology.main.name.as_str(),
            exchange = self.topology.main.exchange.as_str(),
            prefetch,
            rungs = self.topology.dead_letter_queues.len(),
            "Consumer started"
        );
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match self.source.recv().await {
                Ok(Some(delivery)) => {
                    let consumer = self.clone();
                    tokio::spawn(async move {
                        consumer.process(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    event!(Level::WARN, error = %err, "Failed to receive a message");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        // Every permit back means nothing is in flight anymore.
        let _drained = self.permits.acquire_many(prefetch as u32).await;
        event!(Level::INFO, queue = self.topology.main.name.as_str(), "Consumer stopped");
    }

    /// Takes one delivery to its outcome.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let outcome = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => {
                let result = self.handle_with_conflict_retries(&envelope).await;
                self.settle(&delivery, &envelope, result).await
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    topic = delivery.topic.as_str(),
                    offset = delivery.offset,
                    error = %err,
                    "Dropping malformed message"
                );
                self.ack(&delivery, Outcome::Dropped).await
            }
        };
        self.stats.count(outcome);
        outcome
    }

    async fn handle_with_conflict_retries(&self, envelope: &Envelope) -> Result<Handled, MeteringError> {
        let mut conflicts = 0;
        loop {
            match self.handler.handle(envelope).await {
                Err(err) if err.class() == ErrorClass::Conflict && conflicts < self.conflict_retries => {
                    conflicts += 1;
                    event!(Level::DEBUG, attempt = conflicts, error = %err, "Retrying after conflict");
                }
                result => return result,
            }
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        envelope: &Envelope,
        result: Result<Handled, MeteringError>,
    ) -> Outcome {
        let err = match result {
            Ok(handled) => {
                event!(Level::DEBUG, offset = delivery.offset, handled = ?handled, "Message handled");
                return self.ack(delivery, Outcome::Acked(handled)).await;
            }
            Err(err) => err,
        };
        match err.class() {
            ErrorClass::Malformed => {
                event!(Level::WARN, offset = delivery.offset, error = %err, "Dropping invalid usage");
                self.ack(delivery, Outcome::Dropped).await
            }
            ErrorClass::Business => {
                // Only reached without an isolation decorator around the handler.
                event!(Level::WARN, offset = delivery.offset, error = %err, "Dropping usage on business error");
                self.ack(delivery, Outcome::Dropped).await
            }
            ErrorClass::Conflict | ErrorClass::Transient => {
                self.dead_letter(delivery, envelope, &err).await
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, envelope: &Envelope, err: &MeteringError) -> Outcome {
        let retry_count = envelope.metadata.retry_count;
        let (index, rung) = match self.topology.rung_for(retry_count) {
            Some(rung) => rung,
            None => {
                event!(
                    Level::ERROR,
                    usage_id = envelope.usage_doc.usage_id().as_str(),
                    retries = retry_count,
                    error = %err,
                    "Retry ladder exhausted, rejecting message"
                );
                if let Err(reject_err) = self.source.reject(delivery).await {
                    event!(Level::ERROR, error = %reject_err, "Failed to reject message");
                }
                return Outcome::Exhausted;
            }
        };

        let next = envelope.next_attempt(self.clock.now());
        let published = match next.encode() {
            Ok(payload) => self
                .publisher
                .publish(&rung.exchange, Some(envelope.usage_doc.instance_key().as_str()), &payload)
                .await
                .map_err(MeteringError::from),
            Err(err) => Err(err),
        };
        if let Err(publish_err) = published {
            event!(
                Level::ERROR,
                rung = rung.name.as_str(),
                error = %publish_err,
                "Failed to dead-letter message, leaving it unacknowledged"
            );
            if let Err(release_err) = self.source.release(delivery).await {
                event!(Level::ERROR, offset = delivery.offset, error = %release_err, "Failed to release message");
            }
            return Outcome::Unacknowledged;
        }
        event!(
            Level::DEBUG,
            rung = rung.name.as_str(),
            retry_count = next.metadata.retry_count,
            error = %err,
            "Message dead-lettered"
        );
        self.ack(delivery, Outcome::Retried { rung: index }).await
    }

    async fn ack(&self, delivery: &Delivery, outcome: Outcome) -> Outcome {
        match self.source.ack(delivery).await {
            Ok(()) => outcome,
            Err(err) => {
                event!(Level::ERROR, offset = delivery.offset, error = %err, "Failed to acknowledge message");
                Outcome::Unacknowledged
            }
        }
    }
}

/// Holds the messages of one rung for its TTL, then returns them to the
/// rung's main exchange.
pub struct DeadLetterRelay<S> {
    source: S,
    publisher: Arc<dyn Publisher>,
    rung: DeadLetterQueueConfig,
    clock: Arc<dyn Clock>,
}

impl<S: MessageSource> DeadLetterRelay<S> {
    pub fn new(
        source: S,
        publisher: Arc<dyn Publisher>,
        rung: DeadLetterQueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        DeadLetterRelay {
            source,
            publisher,
            rung,
            clock,
        }
    }

    pub fn rung(&self) -> &DeadLetterQueueConfig {
        &self.rung
    }

    /// Relays until the rung is drained. Returns how many messages went
    /// back to the main exchange.
    pub async fn run(&self) -> usize {
        event!(Level::INFO, rung = self.rung.name.as_str(), ttl = self.rung.ttl, "Relay started");
        let mut relayed = 0;
        loop {
            match self.source.recv().await {
                Ok(Some(delivery)) => {
                    if self.relay(&delivery).await {
                        relayed += 1;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    event!(Level::WARN, rung = self.rung.name.as_str(), error = %err, "Failed to receive a message");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        relayed
    }

    async fn relay(&self, delivery: &Delivery) -> bool {
        let envelope = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                event!(Level::WARN, rung = self.rung.name.as_str(), error = %err, "Dropping malformed message");
                if let Err(ack_err) = self.source.ack(delivery).await {
                    event!(Level::ERROR, error = %ack_err, "Failed to acknowledge message");
                }
                return false;
            }
        };

        let now = self.clock.now();
        let due = envelope.metadata.dead_lettered_at.unwrap_or(now) + self.rung.ttl as i64;
        if due > now {
            tokio::time::sleep(Duration::from_millis((due - now) as u64)).await;
        }

        let sent = self
            .publisher
            .publish(&self.rung.main_exchange, delivery.key.as_deref(), &delivery.payload)
            .await;
        if let Err(err) = sent {
            event!(Level::ERROR, rung = self.rung.name.as_str(), error = %err, "Failed to relay message");
            if let Err(release_err) = self.source.release(delivery).await {
                event!(Level::ERROR, error = %release_err, "Failed to release message");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            return false;
        }
        event!(
            Level::DEBUG,
            rung = self.rung.name.as_str(),
            retry_count = envelope.metadata.retry_count,
            "Message returned to the main exchange"
        );
        match self.source.ack(delivery).await {
            Ok(()) => true,
            Err(err) => {
                event!(Level::ERROR, error = %err, "Failed to acknowledge relayed message");
                true
            }
        }
    }
}
