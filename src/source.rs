//! The receiving side of the queue.
//!
//! A [`MessageSource`] hands out deliveries one at a time and is told how
//! each of them ended. On Kafka a topic stands for an exchange and the
//! consumer group for the queue bound to it; acknowledging a delivery
//! stores an offset for the next background commit.
//!
//! Deliveries are settled concurrently and out of order, while a Kafka
//! offset claims everything below it. The stored offset is therefore never
//! past the lowest delivery still in flight.

use crate::producer::{ClientError, KafkaConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{event, Level};

#[cfg(test)]
use crate::producer::Publisher;
#[cfg(test)]
use std::collections::{HashMap, VecDeque};
#[cfg(test)]
use std::sync::{Arc, Mutex};

/// A message received from the queue, detached from the client buffers.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next delivery. `None` means the source is drained and
    /// will not produce anything else.
    async fn recv(&self) -> Result<Option<Delivery>, ClientError>;

    /// The delivery has been fully dealt with.
    async fn ack(&self, delivery: &Delivery) -> Result<(), ClientError>;

    /// The delivery failed for good. It must not be redelivered.
    async fn reject(&self, delivery: &Delivery) -> Result<(), ClientError>;

    /// The delivery could not be settled. Nothing at or after it is
    /// committed, and it is delivered again.
    async fn release(&self, delivery: &Delivery) -> Result<(), ClientError>;
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// One past the highest settled offset.
    next: i64,
    committed: Option<i64>,
}

/// Offsets handed out and not settled yet, per topic partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: DashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self, delivery: &Delivery) {
        self.partitions
            .entry((delivery.topic.clone(), delivery.partition))
            .or_default()
            .in_flight
            .insert(delivery.offset);
    }

    /// Marks a delivery settled. Returns the offset to store when the
    /// committable position moved forward: the lowest offset still in
    /// flight, or one past the highest settled one when none is.
    pub fn settled(&self, delivery: &Delivery) -> Option<i64> {
        let mut offsets = self
            .partitions
            .entry((delivery.topic.clone(), delivery.partition))
            .or_default();
        offsets.in_flight.remove(&delivery.offset);
        offsets.next = offsets.next.max(delivery.offset + 1);
        let position = offsets
            .in_flight
            .iter()
            .next()
            .copied()
            .unwrap_or(offsets.next);
        let committed = offsets.committed;
        match committed {
            Some(committed) if committed >= position => None,
            _ => {
                offsets.committed = Some(position);
                Some(position)
            }
        }
    }

    /// Last position handed out for storing.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .get(&(topic.to_string(), partition))
            .and_then(|offsets| offsets.committed)
    }

    pub fn in_flight(&self, topic: &str, partition: i32) -> usize {
        self.partitions
            .get(&(topic.to_string(), partition))
            .map(|offsets| offsets.in_flight.len())
            .unwrap_or(0)
    }
}

pub struct KafkaSource {
    consumer: StreamConsumer,
    offsets: OffsetTracker,
}

impl KafkaSource {
    pub fn new(config: KafkaConfig, topics: &[&str]) -> Result<KafkaSource, ClientError> {
        let consumer_config: RdKafkaConfig = config.into();
        let consumer: StreamConsumer = consumer_config
            .create()
            .map_err(ClientError::InvalidConfig)?;
        consumer
            .subscribe(topics)
            .map_err(ClientError::InvalidConfig)?;
        event!(Level::INFO, topics = ?topics, "Subscribed to topics");
        Ok(KafkaSource {
            consumer,
            offsets: OffsetTracker::new(),
        })
    }

    fn settle(&self, delivery: &Delivery) -> Result<(), ClientError> {
        match self.offsets.settled(delivery) {
            // The stored offset is the next one to read.
            Some(position) => self
                .consumer
                .store_offset(&delivery.topic, delivery.partition, position)
                .map_err(ClientError::ReceiveFailed),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&self) -> Result<Option<Delivery>, ClientError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(ClientError::ReceiveFailed)?;
        let delivery = Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        };
        self.offsets.received(&delivery);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ClientError> {
        self.settle(delivery)
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), ClientError> {
        // Kafka has no negative acknowledgement. The consumer already
        // reported the failure, moving past the offset is all that is left.
        self.settle(delivery)
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), ClientError> {
        // The offset stays in flight, which holds the stored position. The
        // partition is rewound so the delivery comes back; what follows it
        // is read again and absorbed as duplicates.
        event!(
            Level::WARN,
            topic = delivery.topic.as_str(),
            partition = delivery.partition,
            offset = delivery.offset,
            "Rewinding partition to redeliver message"
        );
        self.consumer
            .seek(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset),
                Timeout::After(Duration::from_secs(1)),
            )
            .map_err(ClientError::ReceiveFailed)
    }
}

/// In-memory broker: a FIFO per topic with Kafka style offsets,
/// publishing through [`Publisher`].
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<Delivery>>>,
    next_offset: Mutex<i64>,
    offsets: OffsetTracker,
    pub acked: Mutex<Vec<Delivery>>,
    pub rejected: Mutex<Vec<Delivery>>,
    pub released: Mutex<Vec<Delivery>>,
}

#[cfg(test)]
impl MemoryQueue {
    pub fn new() -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::default())
    }

    pub fn push(&self, topic: &str, key: Option<&str>, payload: &[u8]) {
        let offset = {
            let mut next = self.next_offset.lock().unwrap();
            *next += 1;
            *next
        };
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push_back(Delivery {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: key.map(str::to_string),
                payload: payload.to_vec(),
            });
    }

    pub fn pending(&self, topic: &str) -> Vec<Delivery> {
        self.topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Offset a restarted consumer of `topic` would resume from.
    pub fn committed(&self, topic: &str) -> Option<i64> {
        self.offsets.committed(topic, 0)
    }

    pub fn subscribe(self: &Arc<Self>, topics: &[&str]) -> MemorySource {
        MemorySource {
            queue: self.clone(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, topic_name: &str, key: Option<&str>, payload: &[u8]) -> Result<(), ClientError> {
        self.push(topic_name, key, payload);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) struct MemorySource {
    queue: Arc<MemoryQueue>,
    topics: Vec<String>,
}

#[cfg(test)]
#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&self) -> Result<Option<Delivery>, ClientError> {
        let mut topics = self.queue.topics.lock().unwrap();
        for topic in &self.topics {
            if let Some(delivery) = topics.get_mut(topic).and_then(VecDeque::pop_front) {
                self.queue.offsets.received(&delivery);
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ClientError> {
        self.queue.offsets.settled(delivery);
        self.queue.acked.lock().unwrap().push(delivery.clone());
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), ClientError> {
        self.queue.offsets.settled(delivery);
        self.queue.rejected.lock().unwrap().push(delivery.clone());
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), ClientError> {
        self.queue.released.lock().unwrap().push(delivery.clone());
        self.queue
            .topics
            .lock()
            .unwrap()
            .entry(delivery.topic.clone())
            .or_default()
            .push_front(delivery.clone());
        Ok(())
    }
}
