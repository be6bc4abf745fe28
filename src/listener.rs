//! Listeners for the passthrough topic and its dead letter topic

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::broker::BrokerClient;
use crate::consumer::{Payload, RecordHandler, Shutdown};
use crate::error::{HandlerError, Result};
use crate::models::{Customer, DeadLetterEnvelope, InboundRecord};

/// Handler logging every message, decoded as a `Customer` when possible
#[derive(Debug, Clone, Copy, Default)]
pub struct CustomerListener;

#[async_trait]
impl RecordHandler for CustomerListener {
    type Message = Customer;

    async fn handle(
        &self,
        record: &InboundRecord,
        payload: Payload<Customer>,
    ) -> std::result::Result<(), HandlerError> {
        info!(
            topic = %record.topic,
            offset = record.offset,
            "Received message: {}",
            record.payload_lossy()
        );

        match payload {
            Payload::Structured(customer) => info!("Parsed as Customer: {}", customer),
            Payload::Raw(bytes) => info!(
                "Parsed as String message: {}",
                String::from_utf8_lossy(&bytes)
            ),
        }
        Ok(())
    }
}

/// What the dead letter listener learned about one envelope
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterReport {
    pub original_topic: String,
    pub attempts: u32,
    pub has_exception: bool,
    /// The payload decoded as a customer, if it is one
    pub customer: Option<Customer>,
}

/// Consumer of the dead letter topic.
///
/// Only logs: a dead-lettered record is never retried again, and malformed
/// payloads are reported rather than failed.
pub struct DeadLetterListener {
    broker: Arc<dyn BrokerClient>,
    topic: String,
    shutdown: Shutdown,
}

impl DeadLetterListener {
    /// Create a listener; `broker` must be subscribed to `topic`
    pub fn new(broker: Arc<dyn BrokerClient>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Log one dead-lettered record
    pub fn handle_dead_letter(&self, envelope: &DeadLetterEnvelope) -> DeadLetterReport {
        let payload = envelope.record.payload_lossy();

        if envelope.has_failure_reason() {
            error!(
                attempts = envelope.attempt_count,
                failed_at = %envelope.failed_at.to_rfc3339(),
                exception = %envelope.failure_reason,
                "Message sent to DLT from topic '{}'. Payload: {}.",
                envelope.original_topic,
                payload
            );
        } else {
            error!(
                attempts = envelope.attempt_count,
                failed_at = %envelope.failed_at.to_rfc3339(),
                "Message sent to DLT from topic '{}'. Payload: {}.",
                envelope.original_topic,
                payload
            );
        }

        let customer = serde_json::from_slice::<Customer>(&envelope.record.payload).ok();
        match &customer {
            Some(customer) => error!("DLT payload parsed as Customer: {}", customer),
            None => error!("DLT payload is not a Customer, raw payload: {}", payload),
        }

        DeadLetterReport {
            original_topic: envelope.original_topic.clone(),
            attempts: envelope.attempt_count,
            has_exception: envelope.has_failure_reason(),
            customer,
        }
    }

    /// Poll one batch, log each record and commit it
    pub async fn poll_once(&self) -> Result<Vec<DeadLetterReport>> {
        let records = self.broker.poll().await?;
        let mut reports = Vec::with_capacity(records.len());

        for record in records {
            let (topic, partition, offset) = (record.topic.clone(), record.partition, record.offset);
            let envelope = DeadLetterEnvelope::from_dead_letter_record(record);
            reports.push(self.handle_dead_letter(&envelope));
            self.broker.commit(&topic, partition, offset).await?;
        }

        Ok(reports)
    }

    /// Run until shutdown is requested; returns the number of records handled
    pub async fn run(&self) -> Result<u64> {
        info!(topic = %self.topic, "Starting dead letter listener");
        let mut handled = 0u64;

        loop {
            let polled = tokio::select! {
                polled = self.poll_once() => polled,
                _ = self.shutdown.wait() => break,
            };

            match polled {
                Ok(reports) => handled += reports.len() as u64,
                Err(e) => {
                    crate::log_error!(e, "Dead letter listener poll failed", topic = self.topic);
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {},
                        _ = self.shutdown.wait() => {},
                    }
                },
            }
        }

        info!(topic = %self.topic, handled = handled, "Dead letter listener stopped");
        Ok(handled)
    }
}
