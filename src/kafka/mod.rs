//! Kafka broker client
//!
//! This module provides:
//! - rdkafka consumer and producer configuration
//! - `KafkaBroker`, the `BrokerClient` implementation over a `StreamConsumer`
//!   with manual offset commits and a shared `FutureProducer`

mod config;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{Ack, BrokerClient, OutboundRecord};
use crate::config::KafkaConfig;
use crate::error::{Error, PublishError, Result};
use crate::models::{Headers, InboundRecord};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// `BrokerClient` backed by a Kafka cluster
#[derive(Clone)]
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer>,
    producer: FutureProducer,
    batch_size: usize,
    poll_timeout: Duration,
    send_timeout: Duration,
}

impl KafkaBroker {
    /// Create a consumer subscribed to `topics` in the configured group, plus a
    /// producer for retry copies and dead letters
    pub fn new(config: &KafkaConfig, topics: &[String]) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| Error::kafka(format!("Failed to create Kafka producer: {}", e)))?;

        let consumer = Self::subscribed_consumer(config, &config.group_id, topics)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            producer,
            batch_size: config.poll_batch_size.max(1),
            poll_timeout: config.poll_timeout(),
            send_timeout: Duration::from_secs(30),
        })
    }

    /// A second client sharing this client's producer, with its own consumer
    /// in `group_id` subscribed to `topics`
    pub fn subscribe(
        &self,
        config: &KafkaConfig,
        group_id: &str,
        topics: &[String],
    ) -> Result<Self> {
        let consumer = Self::subscribed_consumer(config, group_id, topics)?;
        Ok(Self {
            consumer: Arc::new(consumer),
            ..self.clone()
        })
    }

    fn subscribed_consumer(
        config: &KafkaConfig,
        group_id: &str,
        topics: &[String],
    ) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = config
            .build_consumer_config_for_group(group_id)
            .create()
            .map_err(|e| Error::kafka(format!("Failed to create Kafka consumer: {}", e)))?;

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&names)
            .map_err(|e| Error::kafka(format!("Failed to subscribe to {:?}: {}", names, e)))?;

        info!(group_id = %group_id, topics = ?names, "Kafka consumer subscribed");
        Ok(consumer)
    }
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundRecord {
    let mut headers = Headers::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            headers.insert(
                header.key.to_string(),
                header.value.map(<[u8]>::to_vec).unwrap_or_default(),
            );
        }
    }

    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp: message.timestamp().to_millis(),
    }
}

fn to_owned_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            })
        })
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn poll(&self) -> Result<Vec<InboundRecord>> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        let mut batch = Vec::new();

        while batch.len() < self.batch_size {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(to_inbound(&message)),
                Ok(Err(e)) if batch.is_empty() => {
                    return Err(Error::kafka(format!("Kafka consumer error: {}", e)));
                },
                Ok(Err(e)) => {
                    debug!(error = %e, "Consumer error after partial batch, returning batch");
                    break;
                },
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| Error::kafka(format!("Failed to track offset: {}", e)))?;

        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| Error::kafka(format!("Failed to commit offsets: {}", e)))
    }

    async fn publish(&self, record: OutboundRecord) -> std::result::Result<Ack, PublishError> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(to_owned_headers(&record.headers));
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self.producer.send(future_record, self.send_timeout).await {
            Ok(delivery) => Ok(Ack {
                topic: record.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
            }),
            Err((kafka_error, _)) => Err(PublishError::broker(
                record.topic.clone(),
                kafka_error.to_string(),
            )),
        }
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
            .map_err(|e| {
                Error::kafka(format!(
                    "Failed to seek {}/{} to {}: {}",
                    topic, partition, offset, e
                ))
            })
    }
}
