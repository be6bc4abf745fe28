//! Dead letter sink for permanently failed records

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::broker::{Ack, BrokerClient};
use crate::error::PublishError;
use crate::models::DeadLetterEnvelope;

/// Destination for records that exhausted their attempts
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Name of the destination, used in logs and timeout errors
    fn destination(&self) -> &str;

    /// Forward one envelope. An error means the record was not stored and
    /// must stay uncommitted.
    async fn forward(&self, envelope: &DeadLetterEnvelope) -> Result<Ack, PublishError>;
}

/// Sink publishing to a dead letter topic through a broker client
pub struct BrokerDeadLetterSink {
    broker: Arc<dyn BrokerClient>,
    topic: String,
}

impl BrokerDeadLetterSink {
    /// Create a new sink for `topic`
    pub fn new(broker: Arc<dyn BrokerClient>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    fn destination(&self) -> &str {
        &self.topic
    }

    async fn forward(&self, envelope: &DeadLetterEnvelope) -> Result<Ack, PublishError> {
        let outbound = envelope.to_outbound(&self.topic);

        match self.broker.publish(outbound).await {
            Ok(ack) => {
                info!(
                    original_topic = %envelope.original_topic,
                    attempts = envelope.attempt_count,
                    partition = ack.partition,
                    offset = ack.offset,
                    "Sent message to dead letter topic '{}'",
                    self.topic
                );
                Ok(ack)
            },
            Err(e) => {
                error!(
                    original_topic = %envelope.original_topic,
                    error = %e,
                    "Failed to send message to dead letter topic '{}'",
                    self.topic
                );
                Err(e)
            },
        }
    }
}
