//! Broker client abstraction
//!
//! The consumption loop only needs four operations from a broker: poll a batch
//! of records, commit a processed offset, publish a message and rewind a
//! partition so uncommitted records are delivered again. `KafkaBroker`
//! implements them on top of rdkafka; `InMemoryBroker` keeps topic logs in
//! memory for tests and local runs.

mod memory;

pub use memory::InMemoryBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PublishError, Result};
use crate::models::{Headers, InboundRecord};

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Broker acknowledgement of a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Narrow interface the consumer core needs from a broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetch the next batch of records; an empty batch means nothing arrived
    /// within the client's poll timeout
    async fn poll(&self) -> Result<Vec<InboundRecord>>;

    /// Mark the record at `offset` (and everything before it on the
    /// partition) as processed
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Publish a message
    async fn publish(&self, record: OutboundRecord) -> std::result::Result<Ack, PublishError>;

    /// Move the read position of a partition back to `offset`
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}
