extern crate usage_metering;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use usage_metering::plan::{CachedPlanProvider, MeteringPlan, ResolvedPlans, StaticPlanProvider};
use usage_metering::resilience::ResilientBackend;
use usage_metering::store::MemoryBackend;
use usage_metering::timewindow::{Clock, SystemClock};
use usage_metering::{
    Accumulator, DeadLetterRelay, ErrorIsolation, ErrorStore, KafkaPublisher, KafkaSource,
    MeteringConfig, MeteringPipeline, MeteringStores, Publisher, ReliableConsumer,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kafka broker server in the host:port form, overrides
    /// KAFKA_BOOTSTRAP_SERVERS
    #[arg(short, long)]
    bootstrap_server: Option<String>,
}

fn storage_plan() -> Result<MeteringPlan, serde_json::Error> {
    serde_json::from_value(serde_json::json!({
        "plan_id": "basic",
        "measures": [{ "name": "storage", "unit": "BYTE" }],
        "metrics": [{
            "name": "storage",
            "unit": "GIGABYTE",
            "type": "discrete",
            "meter": { "fn": "divide", "measure": "storage", "divisor": 1073741824.0 },
            "accumulate": "max"
        }]
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = MeteringConfig::from_env()?;
    if let Some(servers) = args.bootstrap_server {
        config.kafka_bootstrap_servers = servers;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = Arc::new(ResilientBackend::new(MemoryBackend::new(), config.resilience()));
    let stores = MeteringStores::open(backend, &config.store_uri, config.partitions)?;
    let plans = CachedPlanProvider::new(
        StaticPlanProvider::new().with_plan(
            "object-storage",
            "basic",
            ResolvedPlans::new(storage_plan()?),
        ),
        1000,
        Duration::from_secs(600),
    );
    let pipeline = MeteringPipeline::new(
        plans,
        Accumulator::new(config.windows.clone()),
        &stores,
        clock.clone(),
    )
    .with_dedup_cache(config.dedup_cache_size, config.dedup_cache_ttl());
    let handler = ErrorIsolation::new(pipeline, ErrorStore::new(stores.errors.clone()), clock.clone());

    let publisher: Arc<dyn Publisher> = Arc::new(KafkaPublisher::new(config.producer_config())?);

    for rung in config.queue.dead_letter_queues.clone() {
        let source = KafkaSource::new(config.consumer_config(&rung.name), &[rung.exchange.as_str()])?;
        let relay = DeadLetterRelay::new(source, publisher.clone(), rung, clock.clone());
        tokio::spawn(async move {
            relay.run().await;
        });
    }

    let main = &config.queue.main;
    let source = KafkaSource::new(config.consumer_config(&main.name), &[main.exchange.as_str()])?;
    let consumer = Arc::new(
        ReliableConsumer::new(source, publisher, handler, config.queue.clone(), clock)
            .with_conflict_retries(config.conflict_retries),
    );
    consumer.clone().run().await;

    let stats = consumer.stats();
    println!(
        "acked {} dropped {} retried {} exhausted {}",
        stats.acked(),
        stats.dropped(),
        stats.retried(),
        stats.exhausted()
    );
    Ok(())
}
