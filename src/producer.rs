//! This module provides an abstraction over a Kafka producer in
//! order to allow client code to instantiate the producer
//! implementation they want without depending on the rdkafka
//! ThreadedProducer.
//!
//! Topics play the role of exchanges: the main queue and every
//! dead-letter rung is a topic. Messages are keyed by resource instance
//! so usage of one instance stays ordered within a partition.

use async_trait::async_trait;
use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::producer::{BaseRecord, FutureProducer, FutureRecord, ThreadedProducer};
use rdkafka::producer::{DeliveryResult, ProducerContext};
use rdkafka::util::Timeout;
use rdkafka::ClientContext;
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

/// This structure wraps the parameters to initialize a producer
/// or a consumer. This struct is there in order not to expose the
/// rdkafka details outside.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    config_map: HashMap<String, String>,
}

impl KafkaConfig {
    pub fn new_producer_config(
        bootstrap_servers: &str,
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("bootstrap.servers".to_string(), bootstrap_servers.into());

        let config = Self { config_map };

        apply_override_params(config, override_params)
    }

    /// Offsets are stored explicitly once a message is acknowledged, and
    /// committed in the background.
    pub fn new_consumer_config(
        bootstrap_servers: &str,
        group_id: &str,
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("bootstrap.servers".to_string(), bootstrap_servers.into());
        config_map.insert("group.id".to_string(), group_id.into());
        config_map.insert("enable.auto.commit".to_string(), "true".into());
        config_map.insert("enable.auto.offset.store".to_string(), "false".into());
        config_map.insert("auto.offset.reset".to_string(), "earliest".into());

        let config = Self { config_map };

        apply_override_params(config, override_params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config_map.get(key).map(String::as_str)
    }
}

impl From<KafkaConfig> for RdKafkaConfig {
    fn from(item: KafkaConfig) -> Self {
        let mut config_obj = RdKafkaConfig::new();
        for (key, val) in item.config_map.iter() {
            config_obj.set(key, val);
        }
        config_obj
    }
}

fn apply_override_params<V>(
    mut config: KafkaConfig,
    override_params: Option<HashMap<String, V>>,
) -> KafkaConfig
where
    V: Into<String>,
{
    if let Some(params) = override_params {
        for (param, value) in params {
            config.config_map.insert(param, value.into());
        }
    }
    config
}

struct CaptureErrorContext;

impl ClientContext for CaptureErrorContext {}

impl ProducerContext for CaptureErrorContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult, _delivery_opaque: Self::DeliveryOpaque) {
        match result {
            Ok(_) => {
                event!(Level::DEBUG, "Message produced.")
            }
            Err((kafka_err, _)) => {
                event!(Level::ERROR, "Message production failed. {}", kafka_err)
            }
        }
    }
}

/// Kafka client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to send a kafka message.
    #[error("failed to send kafka message")]
    SendFailed(#[source] rdkafka::error::KafkaError),

    /// Failed to create a kafka client because of the invalid configuration.
    #[error("failed to create kafka client: invalid kafka config")]
    InvalidConfig(#[source] rdkafka::error::KafkaError),

    /// Failed to receive a message or to store its offset.
    #[error("failed to receive kafka message")]
    ReceiveFailed(#[source] rdkafka::error::KafkaError),
}

/// A basic Kafka Producer trait.
///
/// Shared between the tasks of a consumer, hence `&self`.
pub trait Producer: Send + Sync {
    fn send(&self, topic_name: &str, key: Option<&str>, payload: &[u8]) -> Result<(), ClientError>;
}

pub struct KafkaProducer {
    producer: ThreadedProducer<CaptureErrorContext>,
}

impl KafkaProducer {
    pub fn new(config: KafkaConfig) -> Result<KafkaProducer, ClientError> {
        let producer_config: RdKafkaConfig = config.into();
        Ok(KafkaProducer {
            producer: producer_config
                .create_with_context(CaptureErrorContext)
                .map_err(ClientError::InvalidConfig)?,
        })
    }
}

impl Producer for KafkaProducer {
    fn send(&self, topic_name: &str, key: Option<&str>, payload: &[u8]) -> Result<(), ClientError> {
        let mut record: BaseRecord<'_, str, [u8]> = BaseRecord::to(topic_name).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.producer
            .send(record)
            .map_err(|(error, _message)| ClientError::SendFailed(error))
    }
}

/// Publishing that completes only once the broker has the message.
///
/// Used wherever a message is acknowledged on the strength of having been
/// republished somewhere else, so a lost publish can never be hidden by
/// an acknowledgement that already happened.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic_name: &str, key: Option<&str>, payload: &[u8]) -> Result<(), ClientError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(config: KafkaConfig) -> Result<KafkaPublisher, ClientError> {
        let producer_config: RdKafkaConfig = config.into();
        Ok(KafkaPublisher {
            producer: producer_config
                .create()
                .map_err(ClientError::InvalidConfig)?,
            queue_timeout: Duration::from_secs(5),
        })
    }

    /// How long a publish may wait for room in the local producer queue.
    pub fn with_queue_timeout(mut self, queue_timeout: Duration) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, topic_name: &str, key: Option<&str>, payload: &[u8]) -> Result<(), ClientError> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic_name).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.queue_timeout))
            .await
            .map_err(|(error, _message)| ClientError::SendFailed(error))?;
        event!(Level::DEBUG, topic = topic_name, partition, offset, "Message delivered");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) type SentMessages = Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>;

#[cfg(test)]
#[derive(Default)]
pub(crate) struct DummyProducer {
    pub messages: SentMessages,
}

#[cfg(test)]
impl Producer for DummyProducer {
    fn send(&self, topic_name: &str, key: Option<&str>, payload: &[u8]) -> Result<(), ClientError> {
        self.messages.lock().unwrap().push((
            topic_name.to_string(),
            key.map(str::to_string),
            payload.to_vec(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DummyProducer;
    use super::KafkaConfig;
    use super::Producer;
    use super::{ClientError, KafkaPublisher};
    use rdkafka::config::ClientConfig as RdKafkaConfig;
    use std::collections::HashMap;

    #[test]
    fn test_build_producer_configuration() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "queued.max.messages.kbytes".to_string(),
                "1000000".to_string(),
            )])),
        );

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(
            rdkafka_config.get("queued.max.messages.kbytes"),
            Some("1000000")
        );
    }

    #[test]
    fn test_build_consumer_configuration() {
        let config = KafkaConfig::new_consumer_config(
            "localhost:9092",
            "abacus-collect-queue",
            Some(HashMap::from([(
                "auto.offset.reset".to_string(),
                "latest".to_string(),
            )])),
        );
        assert_eq!(config.get("group.id"), Some("abacus-collect-queue"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(rdkafka_config.get("bootstrap.servers"), Some("localhost:9092"));
    }

    #[test]
    fn test_publisher_rejects_invalid_config() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "no.such.property".to_string(),
                "1".to_string(),
            )])),
        );
        let err = KafkaPublisher::new(config).err().unwrap();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_dummy_producer() {
        let producer = DummyProducer::default();
        let res = producer.send("topic", Some("org-1/instance-1"), "message".as_bytes());
        assert!(res.is_ok());

        let messages = producer.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1.as_deref(), Some("org-1/instance-1"));
    }
}
