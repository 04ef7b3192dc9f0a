extern crate usage_metering;

use clap::Parser;
use usage_metering::usage::MeasuredUsage;
use usage_metering::{KafkaConfig, UsageCollector, UsageDocument};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kafka broker server in the host:port form
    #[arg(short, long)]
    bootstrap_server: String,

    /// Kafka topic standing for the main exchange
    #[arg(short, long)]
    topic: Option<String>,

    #[arg(long, default_value = "org-1")]
    organization_id: String,

    #[arg(long, default_value = "space-1")]
    space_id: String,

    #[arg(long, default_value = "instance-1")]
    resource_instance_id: String,

    /// Bytes of storage in use
    #[arg(long, default_value_t = 1073741824.0)]
    storage: f64,

    /// Unique id of this usage event, used to detect resubmissions
    #[arg(long)]
    event_guid: Option<String>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let kafka_config = KafkaConfig::new_producer_config(args.bootstrap_server.as_str(), None);
    let collector = UsageCollector::new(kafka_config, args.topic.as_deref()).unwrap();

    let now = chrono::Utc::now().timestamp_millis();
    let usage = UsageDocument {
        start: now,
        end: now,
        organization_id: args.organization_id,
        space_id: args.space_id,
        consumer_id: Some("app-1".to_string()),
        resource_id: "object-storage".to_string(),
        plan_id: "basic".to_string(),
        resource_instance_id: args.resource_instance_id,
        account_id: None,
        event_guid: args.event_guid,
        collector_id: None,
        measured_usage: vec![MeasuredUsage {
            measure: "storage".to_string(),
            quantity: args.storage,
        }],
    };

    let id = collector.submit(&usage).unwrap();
    println!("submitted {}", id);
}
