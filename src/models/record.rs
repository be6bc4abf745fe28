//! Inbound record model and retry header vocabulary
//!
//! A record read from the broker carries its own coordinates. Retry copies
//! additionally carry the coordinates of the original delivery in headers so
//! attempt tracking survives the hop through a retry topic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Topic of the original delivery
pub const HEADER_ORIGINAL_TOPIC: &str = "x-original-topic";
/// Partition of the original delivery
pub const HEADER_ORIGINAL_PARTITION: &str = "x-original-partition";
/// Offset of the original delivery
pub const HEADER_ORIGINAL_OFFSET: &str = "x-original-offset";
/// Failed attempts so far
pub const HEADER_DELIVERY_ATTEMPT: &str = "x-delivery-attempt";
/// Earliest handling time of a retry copy, epoch millis
pub const HEADER_RETRY_NOT_BEFORE: &str = "x-retry-not-before";
/// Summary of the last failure
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-exception-message";
/// RFC 3339 time a record was dead-lettered
pub const HEADER_FAILED_AT: &str = "x-failed-at";

/// Record headers, ordered for stable logging
pub type Headers = BTreeMap<String, Vec<u8>>;

/// Stable identity of a message: the coordinates of its original delivery
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RecordIdentity {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Coordinates of one physical delivery (a retry copy has its own)
pub type DeliveryPosition = RecordIdentity;

/// A record as handed over by the broker client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRecord {
    /// Topic the record was read from
    pub topic: String,

    /// Partition the record was read from
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Optional message key
    pub key: Option<Vec<u8>>,

    /// Message payload (empty for tombstones)
    pub payload: Vec<u8>,

    /// Message headers
    #[serde(default)]
    pub headers: Headers,

    /// Broker timestamp in epoch millis, if any
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl InboundRecord {
    /// Create a record without key or headers
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
            timestamp: None,
        }
    }

    /// Set the key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Coordinates of this delivery
    pub fn position(&self) -> DeliveryPosition {
        RecordIdentity::new(self.topic.clone(), self.partition, self.offset)
    }

    /// Identity of the original delivery, falling back to this delivery when
    /// the identity headers are absent or malformed
    pub fn identity(&self) -> RecordIdentity {
        let original = (
            self.header_str(HEADER_ORIGINAL_TOPIC),
            self.header_parse::<i32>(HEADER_ORIGINAL_PARTITION),
            self.header_parse::<i64>(HEADER_ORIGINAL_OFFSET),
        );

        match original {
            (Some(topic), Some(partition), Some(offset)) => {
                RecordIdentity::new(topic, partition, offset)
            },
            _ => self.position(),
        }
    }

    /// Whether this record is a retry copy of an earlier delivery
    pub fn is_redelivery(&self) -> bool {
        self.identity() != self.position()
    }

    /// Failed attempts recorded by the previous hop (0 for first deliveries)
    pub fn delivered_attempts(&self) -> u32 {
        self.header_parse(HEADER_DELIVERY_ATTEMPT).unwrap_or(0)
    }

    /// Scheduled handling time of a retry copy, epoch millis
    pub fn not_before(&self) -> Option<i64> {
        self.header_parse(HEADER_RETRY_NOT_BEFORE)
    }

    /// Header value as UTF-8 text
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    fn header_parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.header_str(name).and_then(|v| v.trim().parse().ok())
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
