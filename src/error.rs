//! Error handling module for RetryForge
//!
//! This module defines the error types used throughout the consumer. Failures
//! that belong to a single record (`DecodeError`, `HandlerError`) are resolved
//! by the retry router into a routing decision; transport failures
//! (`PublishError`) leave the record uncommitted; `InvalidArgument` is only
//! raised while validating configuration.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for RetryForge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RetryForge
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or contract violation (fatal at startup)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client errors (poll, commit, seek)
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// Retry redelivery or dead-letter publish failed
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Attempt tracker persistence errors
    #[error("Attempt tracker error: {0}")]
    Tracker(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown in progress
    #[error("Service is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a Kafka error
    pub fn kafka<S: Into<String>>(msg: S) -> Self {
        Error::Kafka(msg.into())
    }

    /// Create an attempt tracker error
    pub fn tracker<S: Into<String>>(msg: S) -> Self {
        Error::Tracker(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }
}

/// Convert from anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Broker-side publish failure for a retry redelivery or a dead-letter forward
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The broker rejected or failed to deliver the message
    #[error("publish to '{topic}' failed: {reason}")]
    Broker { topic: String, reason: String },

    /// The publish did not complete within the caller-supplied timeout
    #[error("publish to '{topic}' timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
}

impl PublishError {
    /// Create a broker publish error
    pub fn broker(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        PublishError::Broker {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Topic the failed publish targeted
    pub fn topic(&self) -> &str {
        match self {
            PublishError::Broker { topic, .. } | PublishError::Timeout { topic, .. } => topic,
        }
    }
}

/// Structured decoding of a payload failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode error: {message}")]
pub struct DecodeError {
    /// Parser message
    pub message: String,
}

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::new(err.to_string())
    }
}

/// User handler logic failed; always retryable up to the configured maximum
#[derive(Error, Debug)]
#[error("Handler error: {0}")]
pub struct HandlerError(#[from] anyhow::Error);

impl HandlerError {
    /// Create a handler error from a message
    pub fn msg<S>(msg: S) -> Self
    where
        S: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        HandlerError(anyhow::Error::msg(msg))
    }

    /// The underlying error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

/// A per-record failure the retry router turns into a routing decision
#[derive(Error, Debug)]
pub enum ProcessingFailure {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl ProcessingFailure {
    /// Short category name used in logs and dead-letter headers
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingFailure::Decode(_) => "decode_error",
            ProcessingFailure::Handler(_) => "handler_error",
        }
    }

    /// One-line summary of the failure, including its cause chain
    pub fn summary(&self) -> String {
        match self {
            ProcessingFailure::Decode(e) => e.to_string(),
            ProcessingFailure::Handler(e) => format!("{:#}", e.inner()),
        }
    }
}
