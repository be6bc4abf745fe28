//! In-memory broker
//!
//! Topic logs live behind a shared mutex; every client created from the same
//! broker sees the same logs but keeps its own subscription, read positions
//! and committed offsets, like a separate consumer group.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{Ack, BrokerClient, OutboundRecord};
use crate::error::{Error, PublishError, Result};
use crate::models::{Headers, InboundRecord};

type PartitionKey = (String, i32);

#[derive(Debug, Default)]
struct Logs {
    partitions: HashMap<String, i32>,
    records: HashMap<PartitionKey, Vec<InboundRecord>>,
    failing_publishes: HashMap<String, VecDeque<String>>,
    stalled_topics: HashSet<String>,
}

impl Logs {
    fn partition_count(&mut self, topic: &str) -> i32 {
        *self.partitions.entry(topic.to_string()).or_insert(1)
    }

    fn append(
        &mut self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
        headers: Headers,
    ) -> i64 {
        let log = self.records.entry((topic.to_string(), partition)).or_default();
        let offset = log.len() as i64;
        log.push(InboundRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            payload,
            headers,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        });
        offset
    }
}

#[derive(Debug, Default)]
struct ConsumerState {
    subscriptions: Vec<String>,
    positions: HashMap<PartitionKey, i64>,
    committed: HashMap<PartitionKey, i64>,
}

/// Broker keeping partitioned topic logs in memory
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    logs: Arc<Mutex<Logs>>,
    consumer: Arc<Mutex<ConsumerState>>,
    max_batch: usize,
    poll_timeout: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create an empty broker with a client that has no subscriptions
    pub fn new() -> Self {
        Self {
            logs: Arc::new(Mutex::new(Logs::default())),
            consumer: Arc::new(Mutex::new(ConsumerState::default())),
            max_batch: 100,
            poll_timeout: Duration::from_millis(50),
        }
    }

    /// A new client over the same logs, subscribed to `topics`
    pub fn client<S: AsRef<str>>(&self, topics: &[S]) -> Self {
        let consumer = ConsumerState {
            subscriptions: topics.iter().map(|t| t.as_ref().to_string()).collect(),
            ..ConsumerState::default()
        };
        Self {
            logs: Arc::clone(&self.logs),
            consumer: Arc::new(Mutex::new(consumer)),
            max_batch: self.max_batch,
            poll_timeout: self.poll_timeout,
        }
    }

    /// Limit the number of records returned per poll
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Create a topic with the given number of partitions
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.lock_logs()
            .partitions
            .insert(topic.to_string(), partitions.max(1));
    }

    /// Append a record to a partition and return its offset
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.produce_with(topic, partition, None, payload, Headers::new())
    }

    /// Append a record with key and headers and return its offset
    pub fn produce_with(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
        headers: Headers,
    ) -> i64 {
        let mut logs = self.lock_logs();
        let count = logs.partition_count(topic);
        if partition >= count {
            logs.partitions.insert(topic.to_string(), partition + 1);
        }
        logs.append(topic, partition, key, payload.into(), headers)
    }

    /// Make the next `count` publishes to `topic` fail
    pub fn fail_publishes(&self, topic: &str, count: usize, reason: &str) {
        let mut logs = self.lock_logs();
        let queue = logs.failing_publishes.entry(topic.to_string()).or_default();
        queue.extend(std::iter::repeat(reason.to_string()).take(count));
    }

    /// Make every publish to `topic` hang, like a broker that never acks
    pub fn stall_publishes(&self, topic: &str) {
        self.lock_logs().stalled_topics.insert(topic.to_string());
    }

    /// All records of a topic, partition by partition
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        let logs = self.lock_logs();
        let mut keys: Vec<&PartitionKey> =
            logs.records.keys().filter(|(t, _)| t == topic).collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|k| logs.records[k].iter().cloned())
            .collect()
    }

    /// Last committed offset of a partition for this client
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock_consumer()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Number of records not yet read by this client
    pub fn lag(&self) -> usize {
        let logs = self.lock_logs();
        let consumer = self.lock_consumer();
        logs.records
            .iter()
            .filter(|((topic, _), _)| consumer.subscriptions.contains(topic))
            .map(|(key, log)| {
                let position = consumer.positions.get(key).copied().unwrap_or(0);
                log.len().saturating_sub(position as usize)
            })
            .sum()
    }

    fn lock_logs(&self) -> MutexGuard<'_, Logs> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_consumer(&self) -> MutexGuard<'_, ConsumerState> {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_batch(&self) -> Vec<InboundRecord> {
        let logs = self.lock_logs();
        let mut consumer = self.lock_consumer();

        let mut keys: Vec<PartitionKey> = logs
            .records
            .keys()
            .filter(|(topic, _)| consumer.subscriptions.contains(topic))
            .cloned()
            .collect();
        keys.sort();

        let mut batch = Vec::new();
        for key in keys {
            let log = &logs.records[&key];
            let position = consumer.positions.entry(key).or_insert(0);
            while batch.len() < self.max_batch && (*position as usize) < log.len() {
                batch.push(log[*position as usize].clone());
                *position += 1;
            }
        }
        batch
    }
}

fn partition_for(key: Option<&[u8]>, partitions: i32) -> i32 {
    match key {
        Some(key) => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as i32
        },
        None => 0,
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn poll(&self) -> Result<Vec<InboundRecord>> {
        let batch = self.take_batch();
        if batch.is_empty() {
            tokio::time::sleep(self.poll_timeout).await;
        }
        Ok(batch)
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut consumer = self.lock_consumer();
        let entry = consumer
            .committed
            .entry((topic.to_string(), partition))
            .or_insert(offset);
        if offset < *entry {
            return Err(Error::kafka(format!(
                "commit of {}/{}@{} would move the committed offset backwards",
                topic, partition, offset
            )));
        }
        *entry = offset;
        Ok(())
    }

    async fn publish(&self, record: OutboundRecord) -> std::result::Result<Ack, PublishError> {
        let stalled = self.lock_logs().stalled_topics.contains(&record.topic);
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut logs = self.lock_logs();

        if let Some(reason) = logs
            .failing_publishes
            .get_mut(&record.topic)
            .and_then(VecDeque::pop_front)
        {
            return Err(PublishError::broker(record.topic, reason));
        }

        let count = logs.partition_count(&record.topic);
        let partition = partition_for(record.key.as_deref(), count);
        let offset = logs.append(
            &record.topic,
            partition,
            record.key,
            record.payload,
            record.headers,
        );

        Ok(Ack {
            topic: record.topic,
            partition,
            offset,
        })
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.lock_consumer()
            .positions
            .insert((topic.to_string(), partition), offset.max(0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_returns_subscribed_records_once() {
        let broker = InMemoryBroker::new();
        broker.produce("orders", 0, "a");
        broker.produce("orders", 0, "b");
        broker.produce("other", 0, "c");

        let client = broker.client(&["orders"]);
        let batch = client.poll().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].offset, 0);
        assert_eq!(batch[1].payload, b"b".to_vec());

        assert!(client.poll().await.unwrap().is_empty());
        assert_eq!(client.lag(), 0);
    }

    #[tokio::test]
    async fn test_rewind_redelivers() {
        let broker = InMemoryBroker::new();
        broker.produce("orders", 0, "a");
        broker.produce("orders", 0, "b");

        let client = broker.client(&["orders"]);
        client.poll().await.unwrap();
        client.rewind("orders", 0, 1).await.unwrap();

        let batch = client.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, 1);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let client = InMemoryBroker::new().client(&["orders"]);
        client.commit("orders", 0, 5).await.unwrap();
        assert_eq!(client.committed("orders", 0), Some(5));
        assert!(client.commit("orders", 0, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_publish_failure() {
        let broker = InMemoryBroker::new();
        broker.fail_publishes("orders-dlt", 1, "leader not available");

        let record = OutboundRecord {
            topic: "orders-dlt".to_string(),
            key: None,
            payload: b"x".to_vec(),
            headers: Headers::new(),
        };

        let err = broker.publish(record.clone()).await.unwrap_err();
        assert!(err.to_string().contains("leader not available"));

        let ack = broker.publish(record).await.unwrap();
        assert_eq!(ack.offset, 0);
        assert_eq!(broker.records("orders-dlt").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_publish_never_completes() {
        let broker = InMemoryBroker::new();
        broker.stall_publishes("orders-retry-0");

        let record = OutboundRecord {
            topic: "orders-retry-0".to_string(),
            key: None,
            payload: b"x".to_vec(),
            headers: Headers::new(),
        };

        let published =
            tokio::time::timeout(Duration::from_secs(60), broker.publish(record)).await;
        assert!(published.is_err());
        assert!(broker.records("orders-retry-0").is_empty());
    }

    #[tokio::test]
    async fn test_max_batch_limits_poll() {
        let broker = InMemoryBroker::new();
        for i in 0..5 {
            broker.produce("orders", 0, format!("r{}", i));
        }

        let client = broker.client(&["orders"]).with_max_batch(2);
        assert_eq!(client.poll().await.unwrap().len(), 2);
        assert_eq!(client.poll().await.unwrap().len(), 2);
        assert_eq!(client.poll().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_publish_is_sticky() {
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", 4);

        let publish = |key: &str| OutboundRecord {
            topic: "orders".to_string(),
            key: Some(key.as_bytes().to_vec()),
            payload: Vec::new(),
            headers: Headers::new(),
        };

        let first = broker.publish(publish("customer-1")).await.unwrap();
        let second = broker.publish(publish("customer-1")).await.unwrap();
        assert_eq!(first.partition, second.partition);
    }
}
