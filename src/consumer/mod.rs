//! Consumption loop
//!
//! Polls batches from the broker, hands each record to the user handler and
//! routes failures through the retry router. A record's offset is committed
//! only after it was handled, republished as a retry copy or forwarded to the
//! dead letter sink. Anything else (a failed publish, a timeout, shutdown)
//! rewinds the partition to the record so the broker delivers it again.
//!
//! Partitions of a batch are processed concurrently, bounded by the worker
//! limit; records of one partition are processed in offset order.

mod handler;
mod observer;
mod shutdown;

pub use handler::{decode, ParseFailurePolicy, Payload, RecordHandler};
pub use observer::{ConsumerObserver, NoopObserver, TracingObserver};
pub use shutdown::{shutdown_signal, Shutdown};

use backoff::ExponentialBackoff;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

use crate::broker::{Ack, BrokerClient, OutboundRecord};
use crate::config::Config;
use crate::error::{Error, ProcessingFailure, PublishError, Result};
use crate::logging::{LogMetrics, Metric};
use crate::models::{DeadLetterEnvelope, InboundRecord};
use crate::retry::{RetryRouter, RouteDecision};
use crate::sink::DeadLetterSink;

/// Tunables of the consumption loop
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub parse_failure_policy: ParseFailurePolicy,

    /// Upper bound for a retry publish or a dead-letter forward
    pub publish_timeout: Duration,

    /// How long in-flight work may continue after shutdown was requested
    pub shutdown_grace: Duration,

    /// Partitions processed concurrently
    pub worker_concurrency: usize,

    /// Pause after a failed poll
    pub poll_error_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            parse_failure_policy: ParseFailurePolicy::Downgrade,
            publish_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            worker_concurrency: 4,
            poll_error_backoff: Duration::from_secs(1),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parse_failure_policy: config.retry.parse_failure_policy,
            publish_timeout: config.retry.publish_timeout(),
            shutdown_grace: config.server.shutdown_timeout(),
            worker_concurrency: config.processing.worker_concurrency.max(1),
            ..Self::default()
        }
    }
}

/// What happened to a record whose offset was committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The handler succeeded
    Handled,
    /// A retry copy was published
    Retried { attempt: u32, topic: String },
    /// The record was forwarded to the dead letter sink
    DeadLettered { attempts: u32 },
}

impl RecordOutcome {
    fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Handled => "handled",
            RecordOutcome::Retried { .. } => "retried",
            RecordOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Result of processing one polled batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records in the batch
    pub records: usize,
    /// Records whose offsets were committed
    pub committed: usize,
    /// Partitions rewound because a record could not be completed
    pub rewound: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.records += other.records;
        self.committed += other.committed;
        self.rewound += other.rewound;
    }
}

/// Running counters of a consumption loop
#[derive(Debug, Default)]
pub struct LoopStats {
    received: AtomicU64,
    committed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStatsSnapshot {
    pub received: u64,
    pub committed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Records left uncommitted because routing could not complete
    pub failed: u64,
}

impl LoopStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Consumer loop around a user handler
pub struct ConsumptionLoop<H: RecordHandler> {
    broker: Arc<dyn BrokerClient>,
    handler: Arc<H>,
    router: Arc<RetryRouter>,
    sink: Arc<dyn DeadLetterSink>,
    observer: Arc<dyn ConsumerObserver>,
    settings: LoopSettings,
    shutdown: Shutdown,
    workers: Semaphore,
    stats: LoopStats,
}

impl<H: RecordHandler> ConsumptionLoop<H> {
    /// Create a new loop. The broker client must be subscribed to
    /// [`RetryRouter::consumed_topics`].
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        handler: Arc<H>,
        router: Arc<RetryRouter>,
        sink: Arc<dyn DeadLetterSink>,
        settings: LoopSettings,
    ) -> Self {
        let workers = Semaphore::new(settings.worker_concurrency.max(1));
        Self {
            broker,
            handler,
            router,
            sink,
            observer: Arc::new(TracingObserver),
            settings,
            shutdown: Shutdown::new(),
            workers,
            stats: LoopStats::default(),
        }
    }

    /// Replace the default tracing observer
    pub fn with_observer(mut self, observer: Arc<dyn ConsumerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share a shutdown handle with other components
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that stops the loop when triggered
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> LoopStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn router(&self) -> &RetryRouter {
        &self.router
    }

    /// Run until shutdown is requested
    pub async fn run(&self) -> Result<LoopStatsSnapshot> {
        info!(
            topics = ?self.router.consumed_topics(),
            dead_letter_topic = %self.sink.destination(),
            max_attempts = self.router.policy().max_attempts(),
            workers = self.settings.worker_concurrency,
            "Starting consumption loop"
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let polled = tokio::select! {
                polled = self.broker.poll() => polled,
                _ = self.shutdown.wait() => break,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    crate::log_error!(e, "Failed to poll records");
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_error_backoff) => {},
                        _ = self.shutdown.wait() => {},
                    }
                    continue;
                },
            };

            if records.is_empty() {
                continue;
            }

            let work = self.process_batch(records);
            tokio::pin!(work);

            tokio::select! {
                _ = &mut work => {},
                _ = self.shutdown.wait() => {
                    info!(
                        grace_secs = self.settings.shutdown_grace.as_secs(),
                        "Shutdown requested, waiting for in-flight records"
                    );
                    if tokio::time::timeout(self.settings.shutdown_grace, &mut work)
                        .await
                        .is_err()
                    {
                        warn!("Grace period elapsed, abandoning in-flight records uncommitted");
                    }
                    break;
                },
            }
        }

        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            committed = stats.committed,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            failed = stats.failed,
            "Consumption loop stopped"
        );
        Ok(stats)
    }

    /// Poll one batch and process it
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let records = self.broker.poll().await?;
        Ok(self.process_batch(records).await)
    }

    /// Process a batch: partitions concurrently, records of a partition in order
    pub async fn process_batch(&self, records: Vec<InboundRecord>) -> BatchReport {
        if records.is_empty() {
            return BatchReport::default();
        }

        let span = crate::batch_span!(records.len());
        let started = tokio::time::Instant::now();

        let mut partitions: BTreeMap<(String, i32), Vec<InboundRecord>> = BTreeMap::new();
        for record in records {
            partitions
                .entry((record.topic.clone(), record.partition))
                .or_default()
                .push(record);
        }

        let reports = join_all(
            partitions
                .into_values()
                .map(|records| self.process_partition(records)),
        )
        .instrument(span.clone())
        .await;

        let mut report = BatchReport::default();
        for partition_report in reports {
            report.merge(partition_report);
        }

        let elapsed = started.elapsed();
        span.record("committed", report.committed);
        span.record("rewound", report.rewound);
        span.record("duration_ms", elapsed.as_millis() as u64);
        LogMetrics::record(Metric::BatchDurationMs, elapsed.as_secs_f64() * 1000.0, &[]);
        if let Ok(tracked) = self.router.tracked().await {
            LogMetrics::record(Metric::AttemptsTracked, tracked as f64, &[]);
        }

        report
    }

    async fn process_partition(&self, records: Vec<InboundRecord>) -> BatchReport {
        let mut report = BatchReport {
            records: records.len(),
            ..BatchReport::default()
        };
        let _permit = self.workers.acquire().await.ok();

        for record in &records {
            let completed = match self.process_record(record).await {
                Ok(outcome) => {
                    debug!(
                        identity = %record.identity(),
                        outcome = outcome.label(),
                        "Record completed"
                    );
                    let committed = self.commit(record).await;
                    if committed.is_ok() {
                        if let RecordOutcome::Retried { .. } = outcome {
                            self.hand_off(record).await;
                        }
                    }
                    committed
                },
                Err(e) => {
                    self.observer.on_routing_error(record, &e);
                    LoopStats::bump(&self.stats.failed);
                    Err(e)
                },
            };

            if completed.is_err() {
                self.rewind(record).await;
                report.rewound += 1;
                break;
            }

            LoopStats::bump(&self.stats.committed);
            report.committed += 1;
        }

        report
    }

    /// Handle one record and route its failure. `Ok` means the record may be
    /// committed.
    pub async fn process_record(&self, record: &InboundRecord) -> Result<RecordOutcome> {
        let span = crate::record_span!(record.topic, record.partition, record.offset);
        self.route_record(record).instrument(span).await
    }

    async fn route_record(&self, record: &InboundRecord) -> Result<RecordOutcome> {
        let identity = record.identity();
        let span = tracing::Span::current();
        span.record("identity", tracing::field::display(&identity));

        LoopStats::bump(&self.stats.received);
        self.observer.on_received(record);

        if record.is_redelivery() {
            self.router.restore(record).await?;
            self.wait_until_due(record).await?;
        }

        let failure = match self.invoke_handler(record).await {
            Ok(()) => {
                self.router.acknowledge(&identity).await?;
                self.observer.on_success(record);
                span.record("outcome", "handled");
                return Ok(RecordOutcome::Handled);
            },
            Err(failure) => failure,
        };

        let decision = self.router.handle_failure(record, &failure).await?;
        span.record("attempt", decision.attempts());
        self.observer
            .on_failure(record, &failure, decision.attempts());

        match decision {
            RouteDecision::Retry {
                attempt,
                delay,
                topic,
            } => {
                let copy =
                    self.router
                        .redelivery(record, &failure.summary(), attempt, delay, &topic);
                self.publish(copy).await?;

                LoopStats::bump(&self.stats.retried);
                self.observer
                    .on_retry_scheduled(record, attempt, delay, &topic);
                span.record("outcome", "retried");
                Ok(RecordOutcome::Retried { attempt, topic })
            },
            RouteDecision::DeadLetter { attempts, reason } => {
                let envelope = DeadLetterEnvelope::new(record.clone(), reason, attempts);
                self.forward(&envelope).await?;
                self.router.confirm_dead_letter(&identity).await?;

                LoopStats::bump(&self.stats.dead_lettered);
                self.observer.on_dead_lettered(&envelope);
                span.record("outcome", "dead_lettered");
                Ok(RecordOutcome::DeadLettered { attempts })
            },
        }
    }

    async fn invoke_handler(
        &self,
        record: &InboundRecord,
    ) -> std::result::Result<(), ProcessingFailure> {
        let payload = decode::<H::Message>(&record.payload, self.settings.parse_failure_policy)?;
        self.handler.handle(record, payload).await?;
        Ok(())
    }

    /// Hold a retry copy until its scheduled time
    async fn wait_until_due(&self, record: &InboundRecord) -> Result<()> {
        let Some(not_before) = record.not_before() else {
            return Ok(());
        };
        let remaining = not_before - Utc::now().timestamp_millis();
        if remaining <= 0 {
            return Ok(());
        }

        debug!(wait_ms = remaining, "Holding retry copy until it is due");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => Ok(()),
            _ = self.shutdown.wait() => Err(Error::ShuttingDown),
        }
    }

    async fn publish(&self, record: OutboundRecord) -> Result<Ack> {
        let topic = record.topic.clone();
        let timeout = self.settings.publish_timeout;
        match tokio::time::timeout(timeout, self.broker.publish(record)).await {
            Ok(published) => Ok(published?),
            Err(_) => Err(PublishError::Timeout { topic, timeout }.into()),
        }
    }

    async fn forward(&self, envelope: &DeadLetterEnvelope) -> Result<Ack> {
        let timeout = self.settings.publish_timeout;
        match tokio::time::timeout(timeout, self.sink.forward(envelope)).await {
            Ok(forwarded) => Ok(forwarded?),
            Err(_) => Err(PublishError::Timeout {
                topic: self.sink.destination().to_string(),
                timeout,
            }
            .into()),
        }
    }

    /// Commit with exponential backoff on transient broker errors
    async fn commit(&self, record: &InboundRecord) -> Result<()> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let operation = || async {
            self.broker
                .commit(&record.topic, record.partition, record.offset)
                .await
                .map_err(|e| {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Commit failed, will retry"
                    );
                    backoff::Error::transient(e)
                })
        };

        let committed = backoff::future::retry(backoff, operation).await;
        if committed.is_ok() {
            self.observer.on_committed(record);
        }
        committed
    }

    /// The retry copy carries the attempt count from here on, and whichever
    /// member consumes its topic seeds its own tracker from it
    async fn hand_off(&self, record: &InboundRecord) {
        if let Err(e) = self.router.hand_off(&record.identity()).await {
            crate::record_error!(e, record, "Failed to release attempt state after retry");
        }
    }

    async fn rewind(&self, record: &InboundRecord) {
        if let Err(e) = self
            .broker
            .rewind(&record.topic, record.partition, record.offset)
            .await
        {
            crate::record_error!(e, record, "Failed to rewind partition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::retry::{InMemoryAttemptTracker, RetryPolicy, RetryTopology};
    use crate::sink::BrokerDeadLetterSink;
    use crate::test_utils::ScriptedHandler;

    const TOPIC: &str = "kafka-passthrough";

    fn build(
        broker: &InMemoryBroker,
        handler: Arc<ScriptedHandler>,
        max_attempts: u32,
    ) -> (ConsumptionLoop<ScriptedHandler>, InMemoryBroker) {
        let policy = RetryPolicy::fixed(max_attempts, Duration::from_millis(10)).unwrap();
        let topology = RetryTopology::with_defaults(TOPIC);
        let topics = topology.consumed_topics(&policy);
        let client = broker.client(&topics);
        let router = Arc::new(RetryRouter::new(
            policy,
            topology,
            Arc::new(InMemoryAttemptTracker::new()),
        ));
        let sink = Arc::new(BrokerDeadLetterSink::new(
            Arc::new(broker.clone()),
            "kafka-passthrough-dlt",
        ));
        let consumer = ConsumptionLoop::new(
            Arc::new(client.clone()),
            handler,
            router,
            sink,
            LoopSettings::default(),
        )
        .with_observer(Arc::new(NoopObserver));
        (consumer, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_commits_offset() {
        let broker = InMemoryBroker::new();
        broker.produce(TOPIC, 0, r#"{"id":"1","name":"A","email":"a@x"}"#);

        let (consumer, client) = build(&broker, Arc::new(ScriptedHandler::succeeding()), 4);
        let report = consumer.poll_once().await.unwrap();

        assert_eq!(report.records, 1);
        assert_eq!(report.committed, 1);
        assert_eq!(client.committed(TOPIC, 0), Some(0));
        assert_eq!(consumer.stats().received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_publishes_retry_copy_and_commits() {
        let broker = InMemoryBroker::new();
        broker.produce(TOPIC, 0, "payload");

        let (consumer, client) = build(&broker, Arc::new(ScriptedHandler::failing_times(1)), 4);
        let report = consumer.poll_once().await.unwrap();

        assert_eq!(report.committed, 1);
        assert_eq!(client.committed(TOPIC, 0), Some(0));

        let copies = broker.records("kafka-passthrough-retry-0");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].delivered_attempts(), 1);
        assert_eq!(consumer.stats().retried, 1);

        // The copy carries the count; nothing stays behind locally
        assert_eq!(consumer.router().tracked().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_record_blocks_rest_of_partition() {
        let broker = InMemoryBroker::new();
        broker.produce(TOPIC, 0, "first");
        broker.produce(TOPIC, 0, "second");
        broker.fail_publishes("kafka-passthrough-retry-0", 1, "broker down");

        let handler = Arc::new(ScriptedHandler::failing_payloads(&["first"]));
        let (consumer, client) = build(&broker, handler.clone(), 4);

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.committed, 0);
        assert_eq!(report.rewound, 1);
        assert_eq!(client.committed(TOPIC, 0), None);
        assert_eq!(handler.calls(), 1);
        assert_eq!(consumer.stats().failed, 1);

        // Redelivered from the failed offset; the same delivery is not recounted
        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.committed, 2);
        assert_eq!(client.committed(TOPIC, 0), Some(1));

        let copies = broker.records("kafka-passthrough-retry-0");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].delivered_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partitions_are_processed_independently() {
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC, 2);
        broker.produce(TOPIC, 0, "bad");
        broker.produce(TOPIC, 1, "good");
        broker.fail_publishes("kafka-passthrough-retry-0", 1, "broker down");

        let handler = Arc::new(ScriptedHandler::failing_payloads(&["bad"]));
        let (consumer, client) = build(&broker, handler, 4);

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(client.committed(TOPIC, 0), None);
        assert_eq!(client.committed(TOPIC, 1), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_copy_is_held_until_due() {
        let broker = InMemoryBroker::new();
        let due = Utc::now().timestamp_millis() + 60_000;
        let copy = InboundRecord::new("kafka-passthrough-retry-0", 0, 0, "payload")
            .with_header(crate::models::record::HEADER_ORIGINAL_TOPIC, TOPIC)
            .with_header(crate::models::record::HEADER_ORIGINAL_PARTITION, "0")
            .with_header(crate::models::record::HEADER_ORIGINAL_OFFSET, "0")
            .with_header(crate::models::record::HEADER_DELIVERY_ATTEMPT, "1")
            .with_header(
                crate::models::record::HEADER_RETRY_NOT_BEFORE,
                due.to_string(),
            );

        let (consumer, _client) = build(&broker, Arc::new(ScriptedHandler::succeeding()), 4);
        let shutdown = consumer.shutdown_handle();
        shutdown.trigger();

        let result = consumer.process_record(&copy).await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }
}
