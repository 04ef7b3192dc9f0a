//! Deployment configuration.
//!
//! Defaults describe a working single node deployment. Every setting can
//! be overridden from JSON or from the environment variables the
//! collector deployments already use.

use crate::consumer::QueueTopology;
use crate::error::PartitionError;
use crate::partition::{PartitionRouter, StoreKind};
use crate::producer::KafkaConfig;
use crate::resilience::{ResilienceSettings, RetryPolicy};
use crate::timewindow::{Slack, TimeWindowConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid partition configuration")]
    Partition(#[from] PartitionError),

    #[error("failed to parse configuration")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeteringConfig {
    pub kafka_bootstrap_servers: String,
    pub kafka_params: HashMap<String, String>,
    pub store_uri: String,
    pub queue: QueueTopology,
    pub windows: TimeWindowConfig,
    /// Shards of every partitioned store. Must divide 4000.
    pub partitions: u32,
    pub store_timeout_ms: u64,
    pub store_retries: usize,
    pub store_retry_delay_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub dedup_cache_size: usize,
    pub dedup_cache_ttl_ms: u64,
    pub conflict_retries: u32,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        MeteringConfig {
            kafka_bootstrap_servers: "localhost:9092".to_string(),
            kafka_params: HashMap::new(),
            store_uri: "memory://local".to_string(),
            queue: QueueTopology::default(),
            windows: TimeWindowConfig::default(),
            partitions: 4,
            store_timeout_ms: 5000,
            store_retries: 3,
            store_retry_delay_ms: 100,
            breaker_threshold: 5,
            breaker_cooldown_ms: 30_000,
            dedup_cache_size: 10_000,
            dedup_cache_ttl_ms: 3_600_000,
            conflict_retries: 3,
        }
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

impl MeteringConfig {
    pub fn from_env() -> Result<MeteringConfig, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_json(json: &str) -> Result<MeteringConfig, ConfigError> {
        let config: MeteringConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by whatever `lookup` finds.
    pub fn from_lookup<F>(lookup: F) -> Result<MeteringConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = MeteringConfig::default();

        if let Some(servers) = lookup("KAFKA_BOOTSTRAP_SERVERS") {
            config.kafka_bootstrap_servers = servers;
        }
        if let Some(uri) = lookup("DB_URI") {
            config.store_uri = uri;
        }
        if let Some(partitions) = lookup("DB_PARTITIONS") {
            config.partitions = parse("DB_PARTITIONS", &partitions)?;
        }
        if let Some(slack) = lookup("SLACK") {
            config.windows.slack = Some(parse::<Slack>("SLACK", &slack)?);
        }

        let queue = &mut config.queue;
        if let Some(name) = lookup("ABACUS_COLLECT_QUEUE") {
            queue.main.name = name;
        }
        if let Some(exchange) = lookup("MAIN_EXCHANGE") {
            for rung in queue.dead_letter_queues.iter_mut() {
                rung.main_exchange = exchange.clone();
            }
            queue.main.exchange = exchange;
        }
        if let Some(limit) = lookup("PREFETCH_LIMIT") {
            queue.main.prefetch_limit = parse("PREFETCH_LIMIT", &limit)?;
        }

        let rungs: [[&'static str; 4]; 2] = [
            ["FIRST_DL_NAME", "FIRST_DL_EXCHANGE", "FIRST_DL_TTL", "FIRST_DL_RETRIES"],
            ["SECOND_DL_NAME", "SECOND_DL_EXCHANGE", "SECOND_DL_TTL", "SECOND_DL_RETRIES"],
        ];
        for (rung, [name, exchange, ttl, retries]) in queue.dead_letter_queues.iter_mut().zip(rungs) {
            if let Some(value) = lookup(name) {
                rung.name = value;
            }
            if let Some(value) = lookup(exchange) {
                rung.exchange = value;
            }
            if let Some(value) = lookup(ttl) {
                rung.ttl = parse(ttl, &value)?;
            }
            if let Some(value) = lookup(retries) {
                rung.retry_attempts = parse(retries, &value)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        PartitionRouter::new(self.partitions, StoreKind::State)?;
        if self.queue.main.prefetch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                name: "PREFETCH_LIMIT",
                value: "0".to_string(),
                reason: "at least one message must be allowed in flight".to_string(),
            });
        }
        if let Some(rung) = self
            .queue
            .dead_letter_queues
            .iter()
            .find(|rung| rung.exchange == self.queue.main.exchange)
        {
            return Err(ConfigError::InvalidValue {
                name: "DL_EXCHANGE",
                value: rung.exchange.clone(),
                reason: "a dead-letter rung cannot publish to the main exchange".to_string(),
            });
        }
        Ok(())
    }

    pub fn resilience(&self) -> ResilienceSettings {
        ResilienceSettings {
            timeout: Duration::from_millis(self.store_timeout_ms),
            retry: RetryPolicy::exponential(
                self.store_retries,
                Duration::from_millis(self.store_retry_delay_ms),
            )
            .with_max_delay(Duration::from_secs(2))
            .with_jitter(0.2),
            breaker_threshold: self.breaker_threshold,
            breaker_cooldown: Duration::from_millis(self.breaker_cooldown_ms),
        }
    }

    pub fn dedup_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_cache_ttl_ms)
    }

    pub fn producer_config(&self) -> KafkaConfig {
        KafkaConfig::new_producer_config(
            &self.kafka_bootstrap_servers,
            Some(self.kafka_params.clone()),
        )
    }

    /// Consumer settings for the queue named `group_id`.
    pub fn consumer_config(&self, group_id: &str) -> KafkaConfig {
        KafkaConfig::new_consumer_config(
            &self.kafka_bootstrap_servers,
            group_id,
            Some(self.kafka_params.clone()),
        )
    }
}
