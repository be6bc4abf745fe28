//! Test utilities for RetryForge
//!
//! This module provides mock handlers, observers and sinks for exercising the
//! consumption loop without a Kafka cluster.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::broker::Ack;
use crate::consumer::{ConsumerObserver, Payload, RecordHandler};
use crate::error::{Error, HandlerError, ProcessingFailure, PublishError};
use crate::models::record::{
    HEADER_DELIVERY_ATTEMPT, HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_PARTITION,
    HEADER_ORIGINAL_TOPIC,
};
use crate::models::{DeadLetterEnvelope, InboundRecord, RecordIdentity};
use crate::sink::DeadLetterSink;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handler whose failures are scripted up front
#[derive(Debug, Clone, Default)]
pub struct ScriptedHandler {
    seen: Arc<Mutex<Vec<(InboundRecord, bool)>>>,
    failures_remaining: Arc<Mutex<u32>>,
    failing_payloads: Vec<String>,
    error_message: String,
}

impl ScriptedHandler {
    /// A handler that always succeeds
    pub fn succeeding() -> Self {
        Self {
            error_message: "scripted failure".to_string(),
            ..Self::default()
        }
    }

    /// A handler that fails its first `times` calls, then succeeds
    pub fn failing_times(times: u32) -> Self {
        let handler = Self::succeeding();
        *lock(&handler.failures_remaining) = times;
        handler
    }

    /// A handler that never succeeds
    pub fn always_failing() -> Self {
        Self::failing_times(u32::MAX)
    }

    /// A handler that fails every record whose payload text is in `payloads`
    pub fn failing_payloads(payloads: &[&str]) -> Self {
        Self {
            failing_payloads: payloads.iter().map(|p| p.to_string()).collect(),
            ..Self::succeeding()
        }
    }

    /// Use `message` as the failure text
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    /// Number of handler invocations
    pub fn calls(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Records the handler saw, in call order
    pub fn seen(&self) -> Vec<InboundRecord> {
        lock(&self.seen).iter().map(|(r, _)| r.clone()).collect()
    }

    /// Invocations that received a raw (undecodable) payload
    pub fn raw_calls(&self) -> usize {
        lock(&self.seen).iter().filter(|(_, structured)| !structured).count()
    }

    fn should_fail(&self, record: &InboundRecord) -> bool {
        if self.failing_payloads.contains(&record.payload_lossy()) {
            return true;
        }
        let mut remaining = lock(&self.failures_remaining);
        if *remaining > 0 {
            *remaining = remaining.saturating_sub(1);
            return true;
        }
        false
    }
}

#[async_trait]
impl RecordHandler for ScriptedHandler {
    type Message = serde_json::Value;

    async fn handle(
        &self,
        record: &InboundRecord,
        payload: Payload<Self::Message>,
    ) -> Result<(), HandlerError> {
        lock(&self.seen).push((record.clone(), payload.is_structured()));
        if self.should_fail(record) {
            return Err(HandlerError::msg(self.error_message.clone()));
        }
        Ok(())
    }
}

/// One observer callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Received(RecordIdentity),
    Success(RecordIdentity),
    Committed(RecordIdentity),
    Failure {
        identity: RecordIdentity,
        kind: &'static str,
        attempts: u32,
    },
    RetryScheduled {
        identity: RecordIdentity,
        attempt: u32,
        topic: String,
    },
    DeadLettered {
        identity: RecordIdentity,
        attempts: u32,
    },
    RoutingError(RecordIdentity),
}

/// Observer keeping every callback in order
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<ObservedEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        lock(&self.events).clone()
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|e| matches!(e, ObservedEvent::DeadLettered { .. }))
    }

    pub fn retries(&self) -> usize {
        self.count(|e| matches!(e, ObservedEvent::RetryScheduled { .. }))
    }

    pub fn routing_errors(&self) -> usize {
        self.count(|e| matches!(e, ObservedEvent::RoutingError(_)))
    }

    fn count(&self, predicate: impl Fn(&ObservedEvent) -> bool) -> usize {
        lock(&self.events).iter().filter(|e| predicate(e)).count()
    }

    fn push(&self, event: ObservedEvent) {
        lock(&self.events).push(event);
    }
}

impl ConsumerObserver for RecordingObserver {
    fn on_received(&self, record: &InboundRecord) {
        self.push(ObservedEvent::Received(record.identity()));
    }

    fn on_success(&self, record: &InboundRecord) {
        self.push(ObservedEvent::Success(record.identity()));
    }

    fn on_committed(&self, record: &InboundRecord) {
        self.push(ObservedEvent::Committed(record.identity()));
    }

    fn on_failure(&self, record: &InboundRecord, failure: &ProcessingFailure, attempts: u32) {
        self.push(ObservedEvent::Failure {
            identity: record.identity(),
            kind: failure.kind(),
            attempts,
        });
    }

    fn on_retry_scheduled(
        &self,
        record: &InboundRecord,
        attempt: u32,
        _delay: Duration,
        topic: &str,
    ) {
        self.push(ObservedEvent::RetryScheduled {
            identity: record.identity(),
            attempt,
            topic: topic.to_string(),
        });
    }

    fn on_dead_lettered(&self, envelope: &DeadLetterEnvelope) {
        self.push(ObservedEvent::DeadLettered {
            identity: envelope.record.identity(),
            attempts: envelope.attempt_count,
        });
    }

    fn on_routing_error(&self, record: &InboundRecord, _error: &Error) {
        self.push(ObservedEvent::RoutingError(record.identity()));
    }
}

/// Dead letter sink keeping envelopes in memory
#[derive(Debug, Clone)]
pub struct RecordingSink {
    destination: String,
    forwarded: Arc<Mutex<Vec<DeadLetterEnvelope>>>,
    failures_remaining: Arc<Mutex<u32>>,
    stalled: bool,
}

impl RecordingSink {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            forwarded: Arc::new(Mutex::new(Vec::new())),
            failures_remaining: Arc::new(Mutex::new(0)),
            stalled: false,
        }
    }

    /// Fail the next `times` forwards
    pub fn failing(self, times: u32) -> Self {
        *lock(&self.failures_remaining) = times;
        self
    }

    /// Never complete a forward
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn forwarded(&self) -> Vec<DeadLetterEnvelope> {
        lock(&self.forwarded).clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn forward(&self, envelope: &DeadLetterEnvelope) -> Result<Ack, PublishError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }

        {
            let mut remaining = lock(&self.failures_remaining);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PublishError::broker(
                    self.destination.clone(),
                    "scripted forward failure",
                ));
            }
        }

        let mut forwarded = lock(&self.forwarded);
        forwarded.push(envelope.clone());
        Ok(Ack {
            topic: self.destination.clone(),
            partition: 0,
            offset: forwarded.len() as i64 - 1,
        })
    }
}

/// Retry copy of `topic/partition@offset` as the previous hop would publish it
pub fn retry_copy(
    retry_topic: &str,
    original: &RecordIdentity,
    attempt: u32,
    payload: &str,
) -> InboundRecord {
    InboundRecord::new(retry_topic, 0, 0, payload)
        .with_header(HEADER_ORIGINAL_TOPIC, original.topic.as_str())
        .with_header(HEADER_ORIGINAL_PARTITION, original.partition.to_string())
        .with_header(HEADER_ORIGINAL_OFFSET, original.offset.to_string())
        .with_header(HEADER_DELIVERY_ATTEMPT, attempt.to_string())
}
