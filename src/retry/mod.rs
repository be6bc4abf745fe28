//! Retry orchestration
//!
//! This module provides:
//! - Retry policy and retry topic naming
//! - Deterministic backoff scheduling
//! - Per-identity attempt tracking (in memory or persisted to a file)
//! - The router that decides between redelivery and dead-lettering

mod backoff;
mod policy;
mod router;
mod tracker;

pub use self::backoff::BackoffScheduler;
pub use policy::{RetryPolicy, RetryTopicStrategy, RetryTopology};
pub use router::{RetryRouter, RouteDecision};
pub use tracker::{AttemptRecord, AttemptTracker, FileAttemptTracker, InMemoryAttemptTracker};
