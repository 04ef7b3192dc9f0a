//! Business error isolation.
//!
//! A document that breaks a business rule will fail the same way on every
//! retry. [`ErrorIsolation`] records such documents in the error store and
//! reports them as handled, so they are acknowledged instead of cycling
//! through the dead-letter ladder. Every other error is passed through.

use crate::consumer::{Handled, UsageHandler};
use crate::docid::tkuri;
use crate::error::{MeteringError, StoreError};
use crate::store::{PartitionedStore, Precondition};
use crate::timewindow::Clock;
use crate::usage::{Envelope, UsageDocument};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub usage: UsageDocument,
    pub error: String,
    pub timestamp: i64,
}

/// Documents rejected for business reasons, kept for operators.
pub struct ErrorStore {
    store: Arc<PartitionedStore>,
}

impl ErrorStore {
    pub fn new(store: Arc<PartitionedStore>) -> Self {
        Self { store }
    }

    pub fn entry_id(usage: &UsageDocument, processed: i64) -> String {
        tkuri(&usage.instance_key(), processed)
    }

    pub async fn record(
        &self,
        usage: &UsageDocument,
        error: &MeteringError,
        processed: i64,
    ) -> Result<String, StoreError> {
        let id = Self::entry_id(usage, processed);
        let entry = ErrorEntry {
            usage: usage.clone(),
            error: error.to_string(),
            timestamp: processed,
        };
        self.store
            .put_json(&usage.instance_key(), processed, &id, &entry, Precondition::Any)
            .await?;
        Ok(id)
    }

    pub async fn get(&self, usage: &UsageDocument, processed: i64) -> Result<Option<ErrorEntry>, StoreError> {
        Ok(self
            .store
            .get_json(&usage.instance_key(), processed, &Self::entry_id(usage, processed))
            .await?
            .map(|(entry, _)| entry))
    }
}

/// Decorates a handler so business errors are diverted to the error store.
pub struct ErrorIsolation<H> {
    inner: H,
    errors: ErrorStore,
    clock: Arc<dyn Clock>,
}

impl<H: UsageHandler> ErrorIsolation<H> {
    pub fn new(inner: H, errors: ErrorStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            errors,
            clock,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: UsageHandler> UsageHandler for ErrorIsolation<H> {
    async fn handle(&self, envelope: &Envelope) -> Result<Handled, MeteringError> {
        match self.inner.handle(envelope).await {
            Err(err) if err.is_business() => {
                let processed = self.clock.now();
                let id = self.errors.record(&envelope.usage_doc, &err, processed).await?;
                event!(
                    Level::WARN,
                    id = id.as_str(),
                    error = %err,
                    "Usage diverted to the error store"
                );
                Ok(Handled::Diverted)
            }
            other => other,
        }
    }
}
