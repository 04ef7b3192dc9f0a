use crate::error::MeteringError;
use crate::producer::{KafkaConfig, KafkaProducer, Producer};
use crate::usage::{Envelope, UsageDocument};
use tracing::{event, Level};

static DEFAULT_TOPIC_NAME: &str = "main-queue-exchange";

/// This is the entry point for resource providers submitting usage.
///
/// Documents are checked before they reach the queue, so the consumers
/// only ever see well formed usage. Each document is published on its own,
/// keyed by its resource instance, which keeps the usage of one instance
/// in order on the broker.
///
/// The collector owns a Kafka producer, so it should be instantiated
/// rarely. Possibly only once per application.
pub struct UsageCollector {
    producer: Box<dyn Producer>,
    topic: String,
}

impl UsageCollector {
    /// Instantiates a UsageCollector from a Kafka config object.
    /// This initialization method lets the `UsageCollector` create
    /// the producer and own it.
    pub fn new(
        producer_config: KafkaConfig,
        topic_name: Option<&str>,
    ) -> Result<UsageCollector, MeteringError> {
        Ok(UsageCollector::new_with_producer(
            Box::new(KafkaProducer::new(producer_config)?),
            topic_name,
        ))
    }

    /// Leaves the responsibility to provide a producer to the
    /// client. Most of the times you should not need to use this.
    pub fn new_with_producer(producer: Box<dyn Producer>, topic_name: Option<&str>) -> UsageCollector {
        let topic = topic_name.unwrap_or(DEFAULT_TOPIC_NAME).to_string();
        UsageCollector { producer, topic }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Validates a usage document and admits it to the main queue with a
    /// fresh retry count. Returns the id the document will be stored under.
    pub fn submit(&self, usage: &UsageDocument) -> Result<String, MeteringError> {
        usage.validate()?;
        let envelope = Envelope::new(usage.clone());
        let payload = envelope.encode()?;
        let key = usage.instance_key();
        self.producer.send(&self.topic, Some(&key), &payload)?;

        let id = usage.usage_id();
        event!(Level::DEBUG, id = id.as_str(), topic = self.topic.as_str(), "Usage submitted");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::producer::DummyProducer;
    use super::UsageCollector;
    use crate::error::{ErrorClass, MeteringError};
    use crate::usage::{test_document, Envelope};

    #[test]
    fn test_submit() {
        let producer = DummyProducer::default();
        let messages = producer.messages.clone();
        let collector = UsageCollector::new_with_producer(Box::new(producer), None);

        let doc = test_document();
        let id = collector.submit(&doc).unwrap();
        assert_eq!(id, doc.usage_id());

        let messages_vec = messages.lock().unwrap();
        assert_eq!(messages_vec.len(), 1);
        let (topic, key, payload) = &messages_vec[0];
        assert_eq!(topic, "main-queue-exchange");
        assert_eq!(key.as_deref(), Some("org-1/instance-1/app-1/basic"));

        let envelope = Envelope::decode(payload).unwrap();
        assert_eq!(envelope.metadata.retry_count, 0);
        assert_eq!(envelope.usage_doc, doc);
    }

    #[test]
    fn test_invalid_usage_is_not_published() {
        let producer = DummyProducer::default();
        let messages = producer.messages.clone();
        let collector =
            UsageCollector::new_with_producer(Box::new(producer), Some("abacus-usage"));
        assert_eq!(collector.topic(), "abacus-usage");

        let mut doc = test_document();
        doc.measured_usage.clear();
        let err = collector.submit(&doc).unwrap_err();
        assert!(matches!(err, MeteringError::InvalidUsage(_)));
        assert_eq!(err.class(), ErrorClass::Malformed);

        let mut doc = test_document();
        doc.end = doc.start - 1;
        assert!(collector.submit(&doc).is_err());

        assert_eq!(messages.lock().unwrap().len(), 0);
    }
}
