//! Configuration module for RetryForge
//!
//! This module handles loading and validating configuration from environment
//! variables, providing strongly-typed configuration structures for the
//! consumer, the retry policy and the dead-letter routing.

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::consumer::ParseFailurePolicy;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, RetryTopicStrategy, RetryTopology};

/// Main configuration structure for RetryForge
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct Config {
    /// Server configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub server: ServerConfig,

    /// Kafka configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    /// Retry and dead-letter configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    /// Processing configuration
    #[serde(flatten)]
    #[envconfig(nested = true)]
    pub processing: ProcessingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ServerConfig {
    /// Log level
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    /// Grace period for in-flight records on shutdown, in seconds
    #[envconfig(from = "SHUTDOWN_TIMEOUT_SECS", default = "30")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Kafka configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Consumer group ID
    #[envconfig(from = "KAFKA_GROUP_ID", default = "group-1")]
    pub group_id: String,

    /// Topic the listener consumes
    #[envconfig(from = "KAFKA_TOPIC", default = "kafka-passthrough")]
    pub topic: String,

    /// Dead letter topic; defaults to `{topic}-dlt`
    #[envconfig(from = "KAFKA_DLT_TOPIC")]
    pub dlt_topic: Option<String>,

    /// Suffix appended to the topic name for retry topics
    #[envconfig(from = "KAFKA_RETRY_TOPIC_SUFFIX", default = "-retry")]
    pub retry_topic_suffix: String,

    /// One retry topic per attempt (per-attempt) or a shared one (single)
    #[envconfig(from = "KAFKA_RETRY_TOPIC_STRATEGY", default = "per-attempt")]
    pub retry_topic_strategy: RetryTopicStrategy,

    /// Auto offset reset (earliest, latest)
    #[envconfig(from = "KAFKA_AUTO_OFFSET_RESET", default = "earliest")]
    pub auto_offset_reset: String,

    /// Session timeout in milliseconds
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout_ms: u32,

    /// Max poll interval in milliseconds
    #[envconfig(from = "KAFKA_MAX_POLL_INTERVAL_MS", default = "300000")]
    pub max_poll_interval_ms: u32,

    /// Maximum records returned by a single poll
    #[envconfig(from = "KAFKA_POLL_BATCH_SIZE", default = "100")]
    pub poll_batch_size: usize,

    /// How long a poll waits to fill a batch, in milliseconds
    #[envconfig(from = "KAFKA_POLL_TIMEOUT_MS", default = "500")]
    pub poll_timeout_ms: u64,

    /// Enable idempotent producer for retry and dead-letter publishes
    #[envconfig(from = "KAFKA_IDEMPOTENT_PRODUCER", default = "true")]
    pub idempotent_producer: bool,

    /// Compression type for the producer
    #[envconfig(from = "KAFKA_COMPRESSION_TYPE", default = "snappy")]
    pub compression_type: String,
}

impl KafkaConfig {
    /// Get brokers as a vector
    pub fn brokers_list(&self) -> Vec<String> {
        self.brokers.split(',').map(|s| s.trim().to_string()).collect()
    }

    /// Dead letter topic, explicit or derived from the main topic
    pub fn dead_letter_topic(&self) -> String {
        self.dlt_topic
            .clone()
            .unwrap_or_else(|| format!("{}-dlt", self.topic))
    }

    /// Get poll timeout as Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Group of the dead letter listener. It subscribes to other topics than
    /// the main consumer, so sharing a group would rebalance both on every
    /// join or leave.
    pub fn dead_letter_group_id(&self) -> String {
        format!("{}-dlt", self.group_id)
    }
}

/// Retry and dead-letter configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct RetryConfig {
    /// Total delivery attempts, the first delivery included
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "4")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[envconfig(from = "RETRY_BACKOFF_BASE_MS", default = "1000")]
    pub backoff_base_ms: u64,

    /// Growth factor between consecutive retry delays
    #[envconfig(from = "RETRY_BACKOFF_MULTIPLIER", default = "2.0")]
    pub backoff_multiplier: f64,

    /// Upper bound for any retry delay, in milliseconds
    #[envconfig(from = "RETRY_BACKOFF_MAX_MS", default = "30000")]
    pub backoff_max_ms: u64,

    /// What to do when the payload does not decode (downgrade, retry)
    #[envconfig(from = "PARSE_FAILURE_POLICY", default = "downgrade")]
    pub parse_failure_policy: ParseFailurePolicy,

    /// Timeout for redelivery and dead-letter publishes, in milliseconds
    #[envconfig(from = "PUBLISH_TIMEOUT_MS", default = "10000")]
    pub publish_timeout_ms: u64,

    /// Optional JSON file that persists attempt counts across restarts
    #[envconfig(from = "ATTEMPT_STORE_PATH")]
    pub attempt_store_path: Option<String>,
}

impl RetryConfig {
    /// Build the validated retry policy
    pub fn policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    /// Get publish timeout as Duration
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Processing configuration
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct ProcessingConfig {
    /// Number of partitions handled concurrently by one consumer
    #[envconfig(from = "WORKER_CONCURRENCY", default = "4")]
    pub worker_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::init_from_env().map_err(Error::from)
    }

    /// Retry topic layout derived from the Kafka settings
    pub fn topology(&self) -> RetryTopology {
        RetryTopology::new(
            self.kafka.topic.clone(),
            self.kafka.retry_topic_suffix.clone(),
            self.kafka.retry_topic_strategy,
            self.kafka.dead_letter_topic(),
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers_list().iter().any(String::is_empty) {
            return Err(Error::invalid_argument(format!(
                "Kafka brokers must be a comma-separated list of host:port, got '{}'",
                self.kafka.brokers
            )));
        }

        if self.kafka.topic.trim().is_empty() {
            return Err(Error::invalid_argument("Kafka topic cannot be empty"));
        }

        if self.kafka.retry_topic_suffix.is_empty() {
            return Err(Error::invalid_argument("Retry topic suffix cannot be empty"));
        }

        if self.kafka.dead_letter_topic() == self.kafka.topic {
            return Err(Error::invalid_argument(
                "Dead letter topic must differ from the consumed topic",
            ));
        }

        if self.kafka.poll_batch_size == 0 {
            return Err(Error::invalid_argument("Poll batch size must be at least 1"));
        }

        if self.retry.publish_timeout_ms == 0 {
            return Err(Error::invalid_argument("Publish timeout must be positive"));
        }

        if self.processing.worker_concurrency == 0 {
            return Err(Error::invalid_argument(
                "Worker concurrency must be at least 1",
            ));
        }

        self.retry.policy().map(|_| ())
    }

    /// Log configuration
    pub fn log_config(&self) {
        tracing::info!(
            environment = %self.server.environment,
            log_level = %self.server.log_level,
            shutdown_timeout_secs = %self.server.shutdown_timeout_secs,
            "Server configuration"
        );

        tracing::info!(
            brokers = %self.kafka.brokers,
            group_id = %self.kafka.group_id,
            topic = %self.kafka.topic,
            dlt_topic = %self.kafka.dead_letter_topic(),
            retry_topic_suffix = %self.kafka.retry_topic_suffix,
            retry_topic_strategy = %self.kafka.retry_topic_strategy,
            "Kafka configuration"
        );

        tracing::info!(
            max_attempts = %self.retry.max_attempts,
            backoff_base_ms = %self.retry.backoff_base_ms,
            backoff_multiplier = %self.retry.backoff_multiplier,
            backoff_max_ms = %self.retry.backoff_max_ms,
            parse_failure_policy = %self.retry.parse_failure_policy,
            attempt_store = self.retry.attempt_store_path.as_deref().unwrap_or("memory"),
            "Retry configuration"
        );

        tracing::info!(
            concurrency = %self.processing.worker_concurrency,
            "Processing configuration"
        );
    }
}
