//! Observability hooks of the consumption loop
//!
//! Hooks are side-channel only: they return nothing, so they cannot change a
//! routing decision.

use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Error, ProcessingFailure};
use crate::logging::{LogMetrics, Metric};
use crate::models::{DeadLetterEnvelope, InboundRecord};

/// Emission points of the consumption loop
pub trait ConsumerObserver: Send + Sync {
    fn on_received(&self, _record: &InboundRecord) {}

    fn on_success(&self, _record: &InboundRecord) {}

    fn on_committed(&self, _record: &InboundRecord) {}

    fn on_failure(&self, _record: &InboundRecord, _failure: &ProcessingFailure, _attempts: u32) {}

    fn on_retry_scheduled(
        &self,
        _record: &InboundRecord,
        _attempt: u32,
        _delay: Duration,
        _topic: &str,
    ) {
    }

    fn on_dead_lettered(&self, _envelope: &DeadLetterEnvelope) {}

    /// Routing could not complete; the record stays uncommitted
    fn on_routing_error(&self, _record: &InboundRecord, _error: &Error) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ConsumerObserver for NoopObserver {}

/// Observer emitting structured logs and counter metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ConsumerObserver for TracingObserver {
    fn on_received(&self, record: &InboundRecord) {
        LogMetrics::increment(Metric::RecordsReceived, &[("topic", &record.topic)]);
    }

    fn on_success(&self, record: &InboundRecord) {
        LogMetrics::increment(Metric::RecordsHandled, &[("topic", &record.topic)]);
    }

    fn on_committed(&self, record: &InboundRecord) {
        LogMetrics::increment(Metric::RecordsCommitted, &[("topic", &record.topic)]);
    }

    fn on_failure(&self, record: &InboundRecord, failure: &ProcessingFailure, attempts: u32) {
        warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            attempts = attempts,
            failure_kind = failure.kind(),
            error = %failure.summary(),
            "Record handling failed"
        );
        LogMetrics::increment(Metric::RecordsFailed, &[("kind", failure.kind())]);
    }

    fn on_retry_scheduled(
        &self,
        record: &InboundRecord,
        attempt: u32,
        delay: Duration,
        topic: &str,
    ) {
        info!(
            identity = %record.identity(),
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            retry_topic = %topic,
            "Retry scheduled"
        );
        LogMetrics::increment(Metric::RecordsRetried, &[("retry_topic", topic)]);
    }

    fn on_dead_lettered(&self, envelope: &DeadLetterEnvelope) {
        error!(
            identity = %envelope.record.identity(),
            original_topic = %envelope.original_topic,
            attempts = envelope.attempt_count,
            reason = %envelope.failure_reason,
            "Record forwarded to dead letter topic"
        );
        LogMetrics::increment(
            Metric::RecordsDeadLettered,
            &[("original_topic", &envelope.original_topic)],
        );
    }

    fn on_routing_error(&self, record: &InboundRecord, err: &Error) {
        crate::record_error!(err, record, "Routing failed, record left uncommitted");
        LogMetrics::increment(Metric::RoutingErrors, &[("topic", &record.topic)]);
    }
}
