//! Dead letter envelope
//!
//! Wraps a terminally failed record with its failure context. On the wire the
//! original key and payload are published unchanged and the context travels in
//! headers, so a dead-letter consumer can decode the payload exactly like the
//! main listener does.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::record::{
    Headers, InboundRecord, HEADER_DELIVERY_ATTEMPT, HEADER_EXCEPTION_MESSAGE, HEADER_FAILED_AT,
    HEADER_ORIGINAL_OFFSET, HEADER_ORIGINAL_PARTITION, HEADER_ORIGINAL_TOPIC,
    HEADER_RETRY_NOT_BEFORE,
};
use crate::broker::OutboundRecord;

/// A permanently failed record plus the context of its failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    /// The record as last delivered
    pub record: InboundRecord,

    /// Topic of the original delivery
    pub original_topic: String,

    /// Summary of the final failure
    pub failure_reason: String,

    /// Attempts made, the first delivery included
    pub attempt_count: u32,

    /// When the record was routed to the dead letter topic
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    /// Build an envelope for a record that exhausted its attempts
    pub fn new(record: InboundRecord, failure_reason: impl Into<String>, attempt_count: u32) -> Self {
        let original_topic = record.identity().topic;
        Self {
            record,
            original_topic,
            failure_reason: failure_reason.into(),
            attempt_count,
            failed_at: Utc::now(),
        }
    }

    /// The message published to the dead letter topic
    pub fn to_outbound(&self, dead_letter_topic: impl Into<String>) -> OutboundRecord {
        let identity = self.record.identity();

        let mut headers: Headers = self.record.headers.clone();
        headers.insert(HEADER_ORIGINAL_TOPIC.to_string(), identity.topic.into_bytes());
        headers.insert(
            HEADER_ORIGINAL_PARTITION.to_string(),
            identity.partition.to_string().into_bytes(),
        );
        headers.insert(
            HEADER_ORIGINAL_OFFSET.to_string(),
            identity.offset.to_string().into_bytes(),
        );
        headers.insert(
            HEADER_DELIVERY_ATTEMPT.to_string(),
            self.attempt_count.to_string().into_bytes(),
        );
        headers.insert(
            HEADER_EXCEPTION_MESSAGE.to_string(),
            self.failure_reason.clone().into_bytes(),
        );
        headers.insert(
            HEADER_FAILED_AT.to_string(),
            self.failed_at.to_rfc3339().into_bytes(),
        );
        headers.remove(HEADER_RETRY_NOT_BEFORE);

        OutboundRecord {
            topic: dead_letter_topic.into(),
            key: self.record.key.clone(),
            payload: self.record.payload.clone(),
            headers,
        }
    }

    /// Rebuild an envelope from a record read off the dead letter topic.
    ///
    /// Missing context headers are tolerated: the original topic falls back to
    /// the record's own topic, the reason to an empty string, the failure time
    /// to the broker timestamp (or now).
    pub fn from_dead_letter_record(record: InboundRecord) -> Self {
        let original_topic = record
            .header_str(HEADER_ORIGINAL_TOPIC)
            .map(str::to_string)
            .unwrap_or_else(|| record.topic.clone());
        let failure_reason = record
            .header_str(HEADER_EXCEPTION_MESSAGE)
            .unwrap_or_default()
            .to_string();
        let failed_at = record
            .header_str(HEADER_FAILED_AT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                record
                    .timestamp
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            })
            .unwrap_or_else(Utc::now);

        Self {
            attempt_count: record.delivered_attempts(),
            original_topic,
            failure_reason,
            failed_at,
            record,
        }
    }

    /// Whether the envelope carries a failure summary
    pub fn has_failure_reason(&self) -> bool {
        !self.failure_reason.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_record() -> InboundRecord {
        InboundRecord::new("kafka-passthrough-retry-2", 0, 12, br#"{"id":"1"}"#.to_vec())
            .with_key("customer-1")
            .with_header(HEADER_ORIGINAL_TOPIC, "kafka-passthrough")
            .with_header(HEADER_ORIGINAL_PARTITION, "3")
            .with_header(HEADER_ORIGINAL_OFFSET, "120")
            .with_header(HEADER_DELIVERY_ATTEMPT, "3")
            .with_header(HEADER_RETRY_NOT_BEFORE, "1")
    }

    #[test]
    fn test_envelope_uses_original_topic() {
        let envelope = DeadLetterEnvelope::new(failed_record(), "boom", 4);
        assert_eq!(envelope.original_topic, "kafka-passthrough");
        assert_eq!(envelope.attempt_count, 4);
    }

    #[test]
    fn test_outbound_keeps_key_and_payload() {
        let envelope = DeadLetterEnvelope::new(failed_record(), "boom", 4);
        let outbound = envelope.to_outbound("kafka-passthrough-dlt");

        assert_eq!(outbound.topic, "kafka-passthrough-dlt");
        assert_eq!(outbound.key.as_deref(), Some(&b"customer-1"[..]));
        assert_eq!(outbound.payload, envelope.record.payload);
        assert_eq!(
            outbound.headers.get(HEADER_DELIVERY_ATTEMPT),
            Some(&b"4".to_vec())
        );
        assert!(!outbound.headers.contains_key(HEADER_RETRY_NOT_BEFORE));
    }

    #[test]
    fn test_rebuilt_envelope_preserves_topic_payload_and_attempts() {
        let envelope = DeadLetterEnvelope::new(failed_record(), "boom", 4);
        let outbound = envelope.to_outbound("kafka-passthrough-dlt");

        let mut dlt_record = InboundRecord::new("kafka-passthrough-dlt", 0, 0, outbound.payload);
        dlt_record.key = outbound.key;
        dlt_record.headers = outbound.headers;

        let rebuilt = DeadLetterEnvelope::from_dead_letter_record(dlt_record);
        assert_eq!(rebuilt.original_topic, envelope.original_topic);
        assert_eq!(rebuilt.record.payload, envelope.record.payload);
        assert_eq!(rebuilt.attempt_count, envelope.attempt_count);
        assert_eq!(rebuilt.failure_reason, "boom");
        assert_eq!(rebuilt.record.identity(), envelope.record.identity());
        assert_eq!(
            rebuilt.failed_at.timestamp_millis(),
            envelope.failed_at.timestamp_millis()
        );
    }

    #[test]
    fn test_rebuild_without_context_headers() {
        let rebuilt = DeadLetterEnvelope::from_dead_letter_record(InboundRecord::new(
            "manual-dlt",
            0,
            5,
            b"not-a-json".to_vec(),
        ));

        assert_eq!(rebuilt.original_topic, "manual-dlt");
        assert!(!rebuilt.has_failure_reason());
        assert_eq!(rebuilt.attempt_count, 0);
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = DeadLetterEnvelope::new(failed_record(), "boom", 4);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"original_topic\":\"kafka-passthrough\""));
        assert!(json.contains("\"attempt_count\":4"));

        let back: DeadLetterEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
