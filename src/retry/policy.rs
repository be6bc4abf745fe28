//! Retry policy and retry topic layout

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// How many times a message may be attempted and how long to wait between
/// attempts. `max_attempts` counts the first delivery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_multiplier: f64,
    backoff_max_delay: Duration,
}

impl RetryPolicy {
    /// Create a validated policy
    pub fn new(
        max_attempts: u32,
        backoff_base: Duration,
        backoff_multiplier: f64,
        backoff_max_delay: Duration,
    ) -> Result<Self> {
        if max_attempts < 1 {
            return Err(Error::invalid_argument(format!(
                "max_attempts must be at least 1, got {}",
                max_attempts
            )));
        }

        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(Error::invalid_argument(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                backoff_multiplier
            )));
        }

        if backoff_max_delay < backoff_base {
            return Err(Error::invalid_argument(format!(
                "backoff_max_delay ({:?}) must not be below backoff_base ({:?})",
                backoff_max_delay, backoff_base
            )));
        }

        Ok(Self {
            max_attempts,
            backoff_base,
            backoff_multiplier,
            backoff_max_delay,
        })
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Result<Self> {
        Self::new(max_attempts, delay, 1.0, delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    pub fn backoff_max_delay(&self) -> Duration {
        self.backoff_max_delay
    }

    /// Number of redeliveries the policy allows
    pub fn max_retries(&self) -> u32 {
        self.max_attempts - 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_max_delay: Duration::from_secs(30),
        }
    }
}

/// Whether each retry attempt gets its own topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryTopicStrategy {
    /// `{topic}{suffix}-0`, `{topic}{suffix}-1`, ...
    PerAttempt,
    /// `{topic}{suffix}` for every retry
    Single,
}

impl FromStr for RetryTopicStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "per-attempt" | "per_attempt" | "multiple" => Ok(RetryTopicStrategy::PerAttempt),
            "single" => Ok(RetryTopicStrategy::Single),
            other => Err(Error::invalid_argument(format!(
                "unknown retry topic strategy '{}' (expected per-attempt or single)",
                other
            ))),
        }
    }
}

impl fmt::Display for RetryTopicStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryTopicStrategy::PerAttempt => write!(f, "per-attempt"),
            RetryTopicStrategy::Single => write!(f, "single"),
        }
    }
}

/// Names of the retry topics and the dead letter topic of one listener topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    topic: String,
    retry_suffix: String,
    strategy: RetryTopicStrategy,
    dead_letter_topic: String,
}

impl RetryTopology {
    pub fn new(
        topic: impl Into<String>,
        retry_suffix: impl Into<String>,
        strategy: RetryTopicStrategy,
        dead_letter_topic: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            retry_suffix: retry_suffix.into(),
            strategy,
            dead_letter_topic: dead_letter_topic.into(),
        }
    }

    /// Topology with the default `-retry` and `-dlt` suffixes
    pub fn with_defaults(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        let dead_letter_topic = format!("{}-dlt", topic);
        Self::new(topic, "-retry", RetryTopicStrategy::PerAttempt, dead_letter_topic)
    }

    /// The listener topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    /// Topic carrying the retry copy published after failed attempt `attempt`
    pub fn retry_topic(&self, attempt: u32) -> String {
        match self.strategy {
            RetryTopicStrategy::PerAttempt => {
                format!("{}{}-{}", self.topic, self.retry_suffix, attempt.saturating_sub(1))
            },
            RetryTopicStrategy::Single => format!("{}{}", self.topic, self.retry_suffix),
        }
    }

    /// Every topic the listener must consume: the main topic plus all retry
    /// topics the policy can produce
    pub fn consumed_topics(&self, policy: &RetryPolicy) -> Vec<String> {
        let mut topics = vec![self.topic.clone()];
        for attempt in 1..policy.max_attempts() {
            let topic = self.retry_topic(attempt);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::new(0, Duration::from_secs(1), 2.0, Duration::from_secs(10)).is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(1), 0.9, Duration::from_secs(10)).is_err());
        assert!(
            RetryPolicy::new(3, Duration::from_secs(1), f64::NAN, Duration::from_secs(10)).is_err()
        );
        assert!(RetryPolicy::new(3, Duration::from_secs(5), 2.0, Duration::from_secs(1)).is_err());
        assert!(RetryPolicy::new(1, Duration::ZERO, 1.0, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.max_retries(), 3);
    }

    #[test]
    fn test_per_attempt_topics() {
        let topology = RetryTopology::with_defaults("kafka-passthrough");
        assert_eq!(topology.retry_topic(1), "kafka-passthrough-retry-0");
        assert_eq!(topology.retry_topic(3), "kafka-passthrough-retry-2");
        assert_eq!(topology.dead_letter_topic(), "kafka-passthrough-dlt");

        let policy = RetryPolicy::default();
        assert_eq!(
            topology.consumed_topics(&policy),
            vec![
                "kafka-passthrough",
                "kafka-passthrough-retry-0",
                "kafka-passthrough-retry-1",
                "kafka-passthrough-retry-2",
            ]
        );
    }

    #[test]
    fn test_single_retry_topic() {
        let topology = RetryTopology::new("orders", ".retry", RetryTopicStrategy::Single, "orders.dlq");
        assert_eq!(topology.retry_topic(1), "orders.retry");
        assert_eq!(topology.retry_topic(5), "orders.retry");

        let policy = RetryPolicy::default();
        assert_eq!(topology.consumed_topics(&policy), vec!["orders", "orders.retry"]);
    }

    #[test]
    fn test_no_retry_topics_for_single_attempt() {
        let topology = RetryTopology::with_defaults("orders");
        let policy = RetryPolicy::fixed(1, Duration::from_secs(1)).unwrap();
        assert_eq!(topology.consumed_topics(&policy), vec!["orders"]);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "per-attempt".parse::<RetryTopicStrategy>().unwrap(),
            RetryTopicStrategy::PerAttempt
        );
        assert_eq!("SINGLE".parse::<RetryTopicStrategy>().unwrap(), RetryTopicStrategy::Single);
        assert!("fanout".parse::<RetryTopicStrategy>().is_err());
    }
}
