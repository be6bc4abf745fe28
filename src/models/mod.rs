//! Data models for RetryForge
//!
//! Records as delivered by the broker, the identity used to correlate retry
//! copies, the dead letter envelope and the customer payload of the
//! passthrough topic.

pub mod customer;
pub mod envelope;
pub mod record;

pub use customer::Customer;
pub use envelope::DeadLetterEnvelope;
pub use record::{DeliveryPosition, Headers, InboundRecord, RecordIdentity};
