//! RetryForge Library
//!
//! Consumer-side retry and dead-letter orchestration for Kafka: a consumption
//! loop with manual commits, per-message attempt tracking, exponential backoff
//! through retry topics and a dead letter topic for records that keep failing.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod listener;
pub mod logging;
pub mod models;
pub mod retry;
pub mod sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{DecodeError, Error, HandlerError, ProcessingFailure, PublishError, Result};

// Re-export the consumer surface
pub use broker::{BrokerClient, InMemoryBroker, OutboundRecord};
pub use consumer::{
    ConsumerObserver, ConsumptionLoop, LoopSettings, ParseFailurePolicy, Payload, RecordHandler,
    Shutdown, TracingObserver,
};
pub use kafka::KafkaBroker;
pub use listener::{CustomerListener, DeadLetterListener};
pub use models::{Customer, DeadLetterEnvelope, InboundRecord, RecordIdentity};
pub use retry::{AttemptTracker, RetryPolicy, RetryRouter, RetryTopology, RouteDecision};
pub use sink::{BrokerDeadLetterSink, DeadLetterSink};
