//! Logging module for RetryForge
//!
//! Tracing setup driven by [`ServerConfig`], the span macros used around
//! batches and records, and the consumer's metrics. There is no metrics
//! backend: every [`Metric`] is written as a structured `Metric recorded`
//! event that log pipelines aggregate.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Filter directives used when `RUST_LOG` is not set. The rdkafka client
/// logs through `log`, so only its warnings are let through.
pub fn default_directives(log_level: &str) -> String {
    format!("retryforge={},rdkafka=warn", log_level)
}

/// Initialize the global subscriber
///
/// Production writes JSON lines with the current span attached, so every
/// event of a record carries its topic, partition and offset. Other
/// environments get compact human-readable output.
pub fn init_tracing(server: &ServerConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&server.log_level)));

    let output = if server.is_production() {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    Registry::default()
        .with(env_filter)
        .with(output)
        .try_init()
        .map_err(|e| Error::internal(format!("Failed to initialize tracing: {}", e)))?;

    tracing::info!(
        environment = %server.environment,
        log_level = %server.log_level,
        "Logging initialized"
    );

    Ok(())
}

/// Create a span for handling one consumed record
#[macro_export]
macro_rules! record_span {
    ($topic:expr, $partition:expr, $offset:expr) => {
        tracing::info_span!(
            "record",
            topic = %$topic,
            partition = $partition,
            offset = $offset,
            identity = tracing::field::Empty,
            attempt = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    };
}

/// Create a span for one polled batch
#[macro_export]
macro_rules! batch_span {
    ($size:expr) => {
        tracing::info_span!(
            "batch",
            size = $size,
            committed = tracing::field::Empty,
            rewound = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        )
    };
}

/// Log an error with extra fields
#[macro_export]
macro_rules! log_error {
    ($error:expr, $msg:expr) => {
        tracing::error!(error = %$error, error_detail = ?$error, $msg)
    };
    ($error:expr, $msg:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::error!(
            error = %$error,
            error_detail = ?$error,
            $($key = tracing::field::display(&$value),)*
            $msg
        )
    };
}

/// Log an error about one record, tagged with its position
#[macro_export]
macro_rules! record_error {
    ($error:expr, $record:expr, $msg:expr) => {
        tracing::error!(
            error = %$error,
            topic = %$record.topic,
            partition = $record.partition,
            offset = $record.offset,
            $msg
        )
    };
}

/// How a metric is aggregated downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// Metrics emitted by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    RecordsReceived,
    RecordsHandled,
    RecordsCommitted,
    RecordsFailed,
    RecordsRetried,
    RecordsDeadLettered,
    RoutingErrors,
    /// Identities with a live attempt count
    AttemptsTracked,
    BatchDurationMs,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::RecordsReceived => "records_received",
            Metric::RecordsHandled => "records_handled",
            Metric::RecordsCommitted => "records_committed",
            Metric::RecordsFailed => "records_failed",
            Metric::RecordsRetried => "records_retried",
            Metric::RecordsDeadLettered => "records_dead_lettered",
            Metric::RoutingErrors => "routing_errors",
            Metric::AttemptsTracked => "attempts_tracked",
            Metric::BatchDurationMs => "batch_duration_ms",
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            Metric::AttemptsTracked => MetricKind::Gauge,
            Metric::BatchDurationMs => MetricKind::Histogram,
            _ => MetricKind::Counter,
        }
    }
}

/// Writes metrics as log events
pub struct LogMetrics;

impl LogMetrics {
    /// Count one occurrence of a counter metric
    pub fn increment(metric: Metric, labels: &[(&str, &str)]) {
        debug_assert_eq!(metric.kind(), MetricKind::Counter);
        tracing::info!(
            metric_type = metric.kind().as_str(),
            metric_name = metric.name(),
            metric_value = 1u64,
            metric_labels = ?labels,
            "Metric recorded"
        );
    }

    /// Record the current value of a gauge or an observation of a histogram
    pub fn record(metric: Metric, value: f64, labels: &[(&str, &str)]) {
        debug_assert_ne!(metric.kind(), MetricKind::Counter);
        tracing::info!(
            metric_type = metric.kind().as_str(),
            metric_name = metric.name(),
            metric_value = value,
            metric_labels = ?labels,
            "Metric recorded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::Context;

    type Captured = Arc<Mutex<Vec<HashMap<String, String>>>>;

    #[derive(Default)]
    struct FieldMap(HashMap<String, String>);

    impl Visit for FieldMap {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0
                .insert(field.name().to_string(), format!("{:?}", value));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }
    }

    struct Capture(Captured);

    impl<S: tracing::Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = FieldMap::default();
            event.record(&mut fields);
            self.0
                .lock()
                .unwrap()
                .push(fields.0);
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<HashMap<String, String>> {
        let events = Captured::default();
        let subscriber = Registry::default().with(Capture(Arc::clone(&events)));
        tracing::subscriber::with_default(subscriber, f);
        let captured = events.lock().unwrap().clone();
        captured
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives("debug"), "retryforge=debug,rdkafka=warn");
        assert!(EnvFilter::try_new(default_directives("info")).is_ok());
    }

    #[test]
    fn test_metric_kinds() {
        assert_eq!(Metric::RecordsRetried.kind(), MetricKind::Counter);
        assert_eq!(Metric::AttemptsTracked.kind(), MetricKind::Gauge);
        assert_eq!(Metric::BatchDurationMs.kind(), MetricKind::Histogram);
        assert_eq!(Metric::RecordsDeadLettered.name(), "records_dead_lettered");
    }

    #[test]
    fn test_counter_event_fields() {
        let events = capture(|| {
            LogMetrics::increment(Metric::RecordsRetried, &[("retry_topic", "orders-retry-0")]);
        });

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event["metric_type"], "counter");
        assert_eq!(event["metric_name"], "records_retried");
        assert_eq!(event["metric_value"], "1");
        assert!(event["metric_labels"].contains("orders-retry-0"));
        assert_eq!(event["message"], "Metric recorded");
    }

    #[test]
    fn test_gauge_event_fields() {
        let events = capture(|| {
            LogMetrics::record(Metric::AttemptsTracked, 3.0, &[]);
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["metric_type"], "gauge");
        assert_eq!(events[0]["metric_name"], "attempts_tracked");
        assert_eq!(events[0]["metric_value"], "3.0");
    }

    #[test]
    fn test_record_error_carries_position() {
        let record = crate::models::InboundRecord::new("orders", 2, 17, b"x".to_vec());
        let events = capture(|| {
            crate::record_error!(Error::kafka("seek failed"), record, "Failed to rewind partition");
        });

        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["topic"], "orders");
        assert_eq!(events[0]["partition"], "2");
        assert_eq!(events[0]["offset"], "17");
        assert!(events[0]["error"].contains("seek failed"));
    }
}
