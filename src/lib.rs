pub mod accumulator;
pub mod aggregator;
pub mod cache;
pub mod carryover;
pub mod collector;
pub mod config;
pub mod consumer;
pub mod dedup;
pub mod docid;
pub mod error;
pub mod isolation;
pub mod lock;
pub mod partition;
pub mod pipeline;
pub mod plan;
pub mod producer;
pub mod report;
pub mod resilience;
pub mod source;
pub mod store;
pub mod timewindow;
pub mod usage;

pub use accumulator::{AccumulatedUsage, Accumulator};
pub use aggregator::{AggregatedUsage, Aggregator, HierarchyLevel};
pub use collector::UsageCollector;
pub use config::MeteringConfig;
pub use consumer::{DeadLetterRelay, QueueTopology, ReliableConsumer, UsageHandler};
pub use error::{ErrorClass, MeteringError};
pub use isolation::{ErrorIsolation, ErrorStore};
pub use pipeline::{MeteringPipeline, MeteringStores};
pub use producer::{KafkaConfig, KafkaProducer, KafkaPublisher, Producer, Publisher};
pub use source::{KafkaSource, MessageSource, OffsetTracker};
pub use usage::{Envelope, UsageDocument};
