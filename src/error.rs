//! Error taxonomy shared by the metering pipeline.
//!
//! Lower layers only classify failures. The decision to acknowledge,
//! retry in place, or hand a message to the dead-letter ladder belongs
//! to the consumer, which reads it from [`MeteringError::class`].

use crate::producer::ClientError;
use std::time::Duration;
use thiserror::Error;

/// How a failure must be treated by the consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// The payload can never be processed. Acknowledge and drop.
    Malformed,
    /// A rule violation inherent to the data. Record and acknowledge.
    Business,
    /// Lost-update detection. Retry right away a bounded number of times.
    Conflict,
    /// Anything else. Retry through the dead-letter ladder.
    Transient,
}

/// Partition routing failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot forward a write operation without a partition key")]
    MissingKey,

    #[error("shard count {0} does not evenly divide the bucket space")]
    InvalidShardCount(u32),

    #[error("timestamp {0} is out of the supported range")]
    InvalidTime(i64),
}

/// Failures of the partitioned stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store {store} is unavailable: {reason}")]
    Unavailable { store: String, reason: String },

    #[error("store {store} call timed out after {timeout:?}")]
    Timeout { store: String, timeout: Duration },

    #[error("store {store} failed fast, circuit open for another {cooldown_ms} ms")]
    CircuitOpen { store: String, cooldown_ms: u64 },

    #[error("revision conflict on document {id}")]
    Conflict { id: String },

    #[error("failed to (de)serialize a stored document")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Partition(#[from] PartitionError),
}

impl StoreError {
    /// Errors worth a retry with backoff around the store call itself.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Timeout { .. }
        )
    }
}

/// Rule violations inherent to a usage document.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusinessError {
    #[error("no metering plan {plan_id} configured for resource {resource_id}")]
    PlanNotFound { resource_id: String, plan_id: String },

    #[error("no pricing plan {pricing_plan_id} configured")]
    PricingPlanNotFound { pricing_plan_id: String },

    #[error("metric {metric} is not part of plan {plan_id}")]
    MetricNotFound { plan_id: String, metric: String },

    #[error("measure {measure} is required by metric {metric}")]
    MissingMeasure { metric: String, measure: String },

    #[error("metric {metric} cannot combine a {expected} quantity with a {found} one")]
    QuantityMismatch {
        metric: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("metric {metric} produced a non finite quantity")]
    NonFiniteQuantity { metric: String },

    #[error("usage ending at {end} is outside the accepted slack window")]
    SlackExceeded { end: i64 },
}

/// Top level error of every pipeline step.
#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("malformed queue payload")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("invalid usage document: {0}")]
    InvalidUsage(String),

    #[error(transparent)]
    Business(#[from] BusinessError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl MeteringError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MeteringError::MalformedPayload(_) | MeteringError::InvalidUsage(_) => {
                ErrorClass::Malformed
            }
            MeteringError::Business(_) => ErrorClass::Business,
            MeteringError::Store(StoreError::Conflict { .. }) => ErrorClass::Conflict,
            MeteringError::Store(StoreError::Serialization(_))
            | MeteringError::Store(StoreError::Partition(PartitionError::InvalidTime(_))) => {
                ErrorClass::Malformed
            }
            MeteringError::Store(_) | MeteringError::Client(_) => ErrorClass::Transient,
        }
    }

    pub fn is_business(&self) -> bool {
        self.class() == ErrorClass::Business
    }
}

impl From<PartitionError> for MeteringError {
    fn from(err: PartitionError) -> Self {
        MeteringError::Store(StoreError::Partition(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let malformed = MeteringError::MalformedPayload(
            serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
        );
        assert_eq!(malformed.class(), ErrorClass::Malformed);

        let business = MeteringError::from(BusinessError::SlackExceeded { end: 0 });
        assert!(business.is_business());

        let conflict = MeteringError::from(StoreError::Conflict { id: "a".into() });
        assert_eq!(conflict.class(), ErrorClass::Conflict);

        let transient = MeteringError::from(StoreError::Unavailable {
            store: "db".into(),
            reason: "down".into(),
        });
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert!(!transient.is_business());

        // A time no store can be routed by never becomes routable.
        let out_of_range = MeteringError::from(PartitionError::InvalidTime(10_000_000_000_000_000));
        assert_eq!(out_of_range.class(), ErrorClass::Malformed);
        let unkeyed = MeteringError::from(PartitionError::MissingKey);
        assert_eq!(unkeyed.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_retryable_store_errors() {
        assert!(StoreError::Timeout {
            store: "db".into(),
            timeout: Duration::from_millis(5)
        }
        .is_retryable());
        assert!(!StoreError::Conflict { id: "x".into() }.is_retryable());
        assert!(!StoreError::CircuitOpen {
            store: "db".into(),
            cooldown_ms: 10
        }
        .is_retryable());
    }
}
