//! Handler contract and the decode step in front of it

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DecodeError, Error, HandlerError};
use crate::models::InboundRecord;

/// What a payload that does not decode into the handler's message type becomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseFailurePolicy {
    /// Hand the raw bytes to the handler
    Downgrade,
    /// Treat the record as failed and route it like a handler error
    Retry,
}

impl FromStr for ParseFailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "downgrade" | "raw" => Ok(ParseFailurePolicy::Downgrade),
            "retry" | "fail" => Ok(ParseFailurePolicy::Retry),
            other => Err(Error::invalid_argument(format!(
                "unknown parse failure policy '{}' (expected downgrade or retry)",
                other
            ))),
        }
    }
}

impl fmt::Display for ParseFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailurePolicy::Downgrade => write!(f, "downgrade"),
            ParseFailurePolicy::Retry => write!(f, "retry"),
        }
    }
}

/// Payload as handed to a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<T> {
    /// Decoded into the handler's message type
    Structured(T),
    /// Did not decode; the original bytes
    Raw(Vec<u8>),
}

impl<T> Payload<T> {
    pub fn is_structured(&self) -> bool {
        matches!(self, Payload::Structured(_))
    }

    pub fn structured(&self) -> Option<&T> {
        match self {
            Payload::Structured(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    /// Raw bytes as text, replacing invalid UTF-8
    pub fn raw_text(&self) -> Option<String> {
        match self {
            Payload::Raw(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Payload::Structured(_) => None,
        }
    }
}

/// Decode a payload as JSON into `T`, applying the parse failure policy
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    policy: ParseFailurePolicy,
) -> Result<Payload<T>, DecodeError> {
    match serde_json::from_slice::<T>(bytes) {
        Ok(value) => Ok(Payload::Structured(value)),
        Err(e) => match policy {
            ParseFailurePolicy::Downgrade => Ok(Payload::Raw(bytes.to_vec())),
            ParseFailurePolicy::Retry => Err(DecodeError::from(e)),
        },
    }
}

/// User-supplied record handler
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Structured type the payload is decoded into
    type Message: DeserializeOwned + Send + Sync + 'static;

    /// Handle one record; an error routes the record to retry or dead letter
    async fn handle(
        &self,
        record: &InboundRecord,
        payload: Payload<Self::Message>,
    ) -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Customer;

    const CUSTOMER: &str = r#"{"id":"123","name":"Alice","email":"alice@example.com","phone":"555-1234"}"#;

    #[test]
    fn test_decode_structured() {
        let payload: Payload<Customer> =
            decode(CUSTOMER.as_bytes(), ParseFailurePolicy::Retry).unwrap();
        assert!(payload.is_structured());
        assert_eq!(payload.structured().unwrap().name, "Alice");
    }

    #[test]
    fn test_decode_partial_customer_is_structured() {
        let payload: Payload<Customer> =
            decode(br#"{"id":"1"}"#, ParseFailurePolicy::Downgrade).unwrap();
        assert!(payload.is_structured());
        assert_eq!(payload.structured().unwrap().id, "1");
    }

    #[test]
    fn test_decode_downgrades_to_raw() {
        let payload: Payload<Customer> =
            decode(b"hello world", ParseFailurePolicy::Downgrade).unwrap();
        assert_eq!(payload, Payload::Raw(b"hello world".to_vec()));
        assert_eq!(payload.raw_text().as_deref(), Some("hello world"));
    }

    #[test]
    fn test_decode_fails_under_retry_policy() {
        let result: Result<Payload<Customer>, DecodeError> =
            decode(b"not-a-json", ParseFailurePolicy::Retry);
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!(
            "Downgrade".parse::<ParseFailurePolicy>().unwrap(),
            ParseFailurePolicy::Downgrade
        );
        assert_eq!(
            "retry".parse::<ParseFailurePolicy>().unwrap(),
            ParseFailurePolicy::Retry
        );
        assert!("ignore".parse::<ParseFailurePolicy>().is_err());
    }
}
