//! Timeouts, retries and circuit breaking around store calls.

use crate::error::StoreError;
use crate::store::{Precondition, Store, StoreBackend, StoredDoc};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::{thread_rng, Rng};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{event, Level};

/// Exponential backoff with a bounded number of attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.max(0.0);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.as_millis().saturating_mul(1u128 << shift);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let jitter = self.jitter_fraction.min(1.0);
        let factor = thread_rng().gen_range((1.0 - jitter).max(0.0)..=1.0 + jitter);
        Duration::from_millis((bounded.as_millis() as f64 * factor).round().max(0.0) as u64)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(self.attempts))
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Fails fast for a cool-down period after repeated failures.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    failures: u32,
    threshold: u32,
    cooldown: Duration,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            open_until: None,
        }
    }

    /// Records a failure. Returns true when it opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        if self.is_open(now) {
            return false;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.threshold {
            self.open_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.open_until = None;
    }

    pub fn is_open(&mut self, now: Instant) -> bool {
        match self.open_until {
            Some(until) if now >= until => {
                self.open_until = None;
                self.failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn cooldown_remaining_ms(&self, now: Instant) -> Option<u64> {
        self.open_until
            .and_then(|until| until.checked_duration_since(now))
            .map(|duration| duration.as_millis() as u64)
    }
}

/// Settings shared by every resilient store of a backend.
#[derive(Clone, Debug)]
pub struct ResilienceSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::exponential(3, Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(2))
                .with_jitter(0.2),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

/// Wraps a store so every call is bounded by a timeout, retried with
/// backoff on transient failures, and refused while the circuit is open.
pub struct ResilientStore {
    inner: Arc<dyn Store>,
    settings: ResilienceSettings,
    breaker: Mutex<CircuitBreaker>,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn Store>, settings: ResilienceSettings) -> Self {
        let breaker = CircuitBreaker::new(settings.breaker_threshold, settings.breaker_cooldown);
        Self {
            inner,
            settings,
            breaker: Mutex::new(breaker),
        }
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut breaker = self.breaker();
        if breaker.is_open(now) {
            return Err(StoreError::CircuitOpen {
                store: self.inner.name().to_string(),
                cooldown_ms: breaker.cooldown_remaining_ms(now).unwrap_or(0),
            });
        }
        Ok(())
    }

    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut retry = self.settings.retry.handle();
        loop {
            self.admit()?;
            let result = match tokio::time::timeout(self.settings.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    store: self.inner.name().to_string(),
                    timeout: self.settings.timeout,
                }),
            };
            let err = match result {
                Ok(value) => {
                    self.breaker().record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if self.breaker().record_failure(Instant::now()) {
                event!(
                    Level::ERROR,
                    store = self.inner.name(),
                    cooldown_ms = self.settings.breaker_cooldown.as_millis() as u64,
                    "Circuit opened"
                );
            }
            match retry.next_delay() {
                Some(delay) => {
                    event!(
                        Level::WARN,
                        store = self.inner.name(),
                        operation,
                        attempt = retry.attempts(),
                        error = %err,
                        "Store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Store for ResilientStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        self.call("get", || self.inner.get(id)).await
    }

    async fn put(&self, id: &str, body: Value, precondition: Precondition) -> Result<u64, StoreError> {
        self.call("put", || self.inner.put(id, body.clone(), precondition))
            .await
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.call("remove", || self.inner.remove(id)).await
    }

    async fn range(
        &self,
        start: &str,
        end: &str,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<StoredDoc>, StoreError> {
        self.call("range", || self.inner.range(start, end, limit, skip))
            .await
    }
}

/// Backend decorator giving each opened database its own resilient
/// wrapper, kept for the life of the backend so breaker state persists.
pub struct ResilientBackend<B> {
    inner: B,
    settings: ResilienceSettings,
    stores: DashMap<String, Arc<ResilientStore>>,
}

impl<B: StoreBackend> ResilientBackend<B> {
    pub fn new(inner: B, settings: ResilienceSettings) -> Self {
        Self {
            inner,
            settings,
            stores: DashMap::new(),
        }
    }
}

impl<B: StoreBackend> StoreBackend for ResilientBackend<B> {
    fn open(&self, server_uri: &str, db_name: &str) -> Arc<dyn Store> {
        let store = self
            .stores
            .entry(format!("{}/{}", server_uri, db_name))
            .or_insert_with(|| {
                Arc::new(ResilientStore::new(
                    self.inner.open(server_uri, db_name),
                    self.settings.clone(),
                ))
            })
            .clone();
        store
    }
}
