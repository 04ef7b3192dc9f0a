//! Usage documents and the queue envelope that carries them.

use crate::docid::kturi;
use crate::error::MeteringError;
use crate::timewindow::is_supported_time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Placeholder used wherever a document does not name a consumer.
pub const UNKNOWN_CONSUMER: &str = "UNKNOWN";

/// One measured quantity, as submitted by a resource provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasuredUsage {
    pub measure: String,
    pub quantity: f64,
}

/// A fact about resource consumption. Immutable once ingested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageDocument {
    pub start: i64,
    pub end: i64,
    pub organization_id: String,
    pub space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_id: Option<String>,
    pub measured_usage: Vec<MeasuredUsage>,
}

impl UsageDocument {
    pub fn consumer(&self) -> &str {
        self.consumer_id.as_deref().unwrap_or(UNKNOWN_CONSUMER)
    }

    /// Key of the resource instance state this document updates.
    pub fn instance_key(&self) -> String {
        [
            self.organization_id.as_str(),
            self.resource_instance_id.as_str(),
            self.consumer(),
            self.plan_id.as_str(),
        ]
        .join("/")
    }

    /// Full hierarchical key, used by the carry-over ledger.
    pub fn hierarchy_key(&self) -> String {
        [
            self.organization_id.as_str(),
            self.space_id.as_str(),
            self.consumer(),
            self.resource_id.as_str(),
            self.plan_id.as_str(),
            self.resource_instance_id.as_str(),
        ]
        .join("/")
    }

    /// Identifier of the source event. Falls back to the collector id.
    pub fn source_id(&self) -> Option<&str> {
        self.event_guid
            .as_deref()
            .or(self.collector_id.as_deref())
    }

    /// Id of the collected document: its instance, its end time and its
    /// source event. Documents without a source id are told apart by a
    /// checksum of their content.
    pub fn usage_id(&self) -> String {
        let source = match self.source_id() {
            Some(id) => id.to_string(),
            None => format!(
                "{:08x}",
                crc32fast::hash(
                    format!("{}/{}/{:?}", self.start, self.end, self.measured_usage).as_bytes()
                )
            ),
        };
        format!("{}/{}", kturi(&self.instance_key(), self.end), source)
    }

    pub fn measures(&self) -> HashMap<&str, f64> {
        self.measured_usage
            .iter()
            .map(|m| (m.measure.as_str(), m.quantity))
            .collect()
    }

    /// Schema checks performed before a document is admitted to the queue.
    pub fn validate(&self) -> Result<(), MeteringError> {
        let required = [
            ("organization_id", &self.organization_id),
            ("space_id", &self.space_id),
            ("resource_id", &self.resource_id),
            ("plan_id", &self.plan_id),
            ("resource_instance_id", &self.resource_instance_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(MeteringError::InvalidUsage(format!("{} is empty", field)));
            }
        }
        for (field, time) in [("start", self.start), ("end", self.end)] {
            if !is_supported_time(time) {
                return Err(MeteringError::InvalidUsage(format!(
                    "{} {} is out of the supported time range",
                    field, time
                )));
            }
        }
        if self.start > self.end {
            return Err(MeteringError::InvalidUsage(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        if self.measured_usage.is_empty() {
            return Err(MeteringError::InvalidUsage(
                "measured_usage is empty".to_string(),
            ));
        }
        if let Some(m) = self.measured_usage.iter().find(|m| !m.quantity.is_finite()) {
            return Err(MeteringError::InvalidUsage(format!(
                "measure {} has a non finite quantity",
                m.measure
            )));
        }
        Ok(())
    }
}

/// Delivery bookkeeping carried next to the document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_lettered_at: Option<i64>,
}

/// What actually travels on the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub metadata: EnvelopeMetadata,
    pub usage_doc: UsageDocument,
}

impl Envelope {
    pub fn new(usage_doc: UsageDocument) -> Self {
        Self {
            metadata: EnvelopeMetadata::default(),
            usage_doc,
        }
    }

    /// Decodes a queue payload. Bare usage documents, as produced by
    /// older collectors, are accepted with a zero retry count.
    pub fn decode(payload: &[u8]) -> Result<Envelope, MeteringError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(MeteringError::MalformedPayload)?;
        let is_envelope = value
            .as_object()
            .map(|o| o.contains_key("usageDoc"))
            .unwrap_or(false);
        if is_envelope {
            serde_json::from_value(value).map_err(MeteringError::MalformedPayload)
        } else {
            let usage_doc =
                serde_json::from_value(value).map_err(MeteringError::MalformedPayload)?;
            Ok(Envelope::new(usage_doc))
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MeteringError> {
        serde_json::to_vec(self).map_err(MeteringError::MalformedPayload)
    }

    /// The envelope to hand to the next dead-letter rung.
    pub fn next_attempt(&self, dead_lettered_at: i64) -> Envelope {
        Envelope {
            metadata: EnvelopeMetadata {
                retry_count: self.metadata.retry_count + 1,
                dead_lettered_at: Some(dead_lettered_at),
            },
            usage_doc: self.usage_doc.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_document() -> UsageDocument {
    UsageDocument {
        start: 1420243200000,
        end: 1420243200000,
        organization_id: "org-1".to_string(),
        space_id: "space-1".to_string(),
        consumer_id: Some("app-1".to_string()),
        resource_id: "object-storage".to_string(),
        plan_id: "basic".to_string(),
        resource_instance_id: "instance-1".to_string(),
        account_id: Some("account-1".to_string()),
        event_guid: Some("event-1".to_string()),
        collector_id: None,
        measured_usage: vec![MeasuredUsage {
            measure: "storage".to_string(),
            quantity: 1073741824.0,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_keys() {
        let mut doc = test_document();
        assert_eq!(doc.instance_key(), "org-1/instance-1/app-1/basic");
        assert_eq!(
            doc.hierarchy_key(),
            "org-1/space-1/app-1/object-storage/basic/instance-1"
        );
        assert_eq!(
            doc.usage_id(),
            "k/org-1/instance-1/app-1/basic/t/0001420243200000/event-1"
        );

        doc.consumer_id = None;
        assert_eq!(doc.instance_key(), "org-1/instance-1/UNKNOWN/basic");

        doc.event_guid = None;
        let anonymous = doc.usage_id();
        assert_eq!(anonymous, doc.usage_id());
        doc.measured_usage[0].quantity = 1.0;
        assert_ne!(anonymous, doc.usage_id());
    }

    #[test]
    fn test_validate() {
        assert!(test_document().validate().is_ok());

        let mut doc = test_document();
        doc.start = doc.end + 1;
        assert!(doc.validate().is_err());

        let mut doc = test_document();
        doc.organization_id = " ".to_string();
        assert!(doc.validate().is_err());

        let mut doc = test_document();
        doc.measured_usage[0].quantity = f64::NAN;
        let err = doc.validate().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Malformed);
    }

    #[test]
    fn test_validate_time_range() {
        let mut doc = test_document();
        doc.start = 10_000_000_000_000_000;
        doc.end = doc.start;
        let err = doc.validate().unwrap_err();
        assert!(matches!(err, MeteringError::InvalidUsage(_)));
        assert_eq!(err.class(), ErrorClass::Malformed);

        let mut doc = test_document();
        doc.start = i64::MIN + 1;
        assert_eq!(doc.validate().unwrap_err().class(), ErrorClass::Malformed);

        let mut doc = test_document();
        doc.start = -1;
        assert!(doc.validate().is_err());

        let mut doc = test_document();
        doc.start = 0;
        doc.end = 253402300799999;
        assert!(doc.validate().is_ok());
        doc.end += 1;
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_decode_envelope() {
        let envelope = Envelope::new(test_document()).next_attempt(5);
        let payload = envelope.encode().unwrap();
        let text = std::str::from_utf8(&payload).unwrap();
        assert!(text.contains("\"retryCount\":1"));
        assert!(text.contains("\"usageDoc\""));

        let decoded = Envelope::decode(&payload).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_legacy_document() {
        let payload = serde_json::to_vec(&test_document()).unwrap();
        let decoded = Envelope::decode(&payload).unwrap();
        assert_eq!(decoded.metadata.retry_count, 0);
        assert_eq!(decoded.usage_doc, test_document());
    }

    #[test]
    fn test_decode_malformed() {
        let err = Envelope::decode(b"{not json").unwrap_err();
        assert!(matches!(err, MeteringError::MalformedPayload(_)));

        let err = Envelope::decode(b"{\"usageDoc\": 3}").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Malformed);
    }
}
