//! Retry router
//!
//! Turns a failed record into a routing decision. All tracker access for one
//! message identity happens under a per-identity lock, so concurrent workers
//! that see copies of the same message cannot interleave their
//! read-modify-write sequences.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::{AttemptTracker, BackoffScheduler, RetryPolicy, RetryTopology};
use crate::broker::OutboundRecord;
use crate::error::{ProcessingFailure, Result};
use crate::models::record::{
    HEADER_DELIVERY_ATTEMPT, HEADER_EXCEPTION_MESSAGE, HEADER_ORIGINAL_OFFSET,
    HEADER_ORIGINAL_PARTITION, HEADER_ORIGINAL_TOPIC, HEADER_RETRY_NOT_BEFORE,
};
use crate::models::{InboundRecord, RecordIdentity};

/// What to do with a failed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Publish a retry copy to `topic`, to be handled after `delay`
    Retry {
        attempt: u32,
        delay: Duration,
        topic: String,
    },

    /// Forward to the dead letter sink
    DeadLetter { attempts: u32, reason: String },
}

impl RouteDecision {
    /// Failed attempts counted when the decision was taken
    pub fn attempts(&self) -> u32 {
        match self {
            RouteDecision::Retry { attempt, .. } => *attempt,
            RouteDecision::DeadLetter { attempts, .. } => *attempts,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, RouteDecision::DeadLetter { .. })
    }
}

#[derive(Debug, Default)]
struct IdentityLocks {
    locks: Mutex<HashMap<RecordIdentity, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    async fn acquire(&self, identity: &RecordIdentity) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(identity.clone()).or_default())
        };
        lock.lock_owned().await
    }

    fn release(&self, identity: &RecordIdentity, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(identity)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(identity);
        }
    }

    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Decides between redelivery and dead-lettering for failed records
pub struct RetryRouter {
    policy: RetryPolicy,
    scheduler: BackoffScheduler,
    topology: RetryTopology,
    tracker: Arc<dyn AttemptTracker>,
    locks: IdentityLocks,
}

impl RetryRouter {
    /// Create a new router
    pub fn new(
        policy: RetryPolicy,
        topology: RetryTopology,
        tracker: Arc<dyn AttemptTracker>,
    ) -> Self {
        Self {
            policy,
            scheduler: BackoffScheduler::new(),
            topology,
            tracker,
            locks: IdentityLocks::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn topology(&self) -> &RetryTopology {
        &self.topology
    }

    /// Topics the listener has to consume for this router's retry copies
    pub fn consumed_topics(&self) -> Vec<String> {
        self.topology.consumed_topics(&self.policy)
    }

    /// Failed attempts recorded for `identity`
    pub async fn attempts(&self, identity: &RecordIdentity) -> Result<u32> {
        self.tracker.current_attempts(identity).await
    }

    /// Records with failures still tracked
    pub async fn tracked(&self) -> Result<usize> {
        self.tracker.tracked().await
    }

    /// Seed the tracker from the attempt count a retry copy carries, so a
    /// restarted consumer continues counting where the previous hop stopped
    pub async fn restore(&self, record: &InboundRecord) -> Result<()> {
        let carried = record
            .delivered_attempts()
            .min(self.policy.max_attempts().saturating_sub(1));
        if carried == 0 {
            return Ok(());
        }

        let identity = record.identity();
        let guard = self.locks.acquire(&identity).await;
        let result = self.tracker.restore(&identity, carried).await;
        self.locks.release(&identity, guard);
        result
    }

    /// Count the failure and decide how to route the record.
    ///
    /// Tracking state is kept on a dead-letter decision; it is cleared by
    /// [`confirm_dead_letter`](Self::confirm_dead_letter) once the forward
    /// succeeded, so a failed forward does not count the delivery twice.
    pub async fn handle_failure(
        &self,
        record: &InboundRecord,
        failure: &ProcessingFailure,
    ) -> Result<RouteDecision> {
        let identity = record.identity();
        let summary = failure.summary();

        let guard = self.locks.acquire(&identity).await;
        let counted = self
            .tracker
            .record_failure(&identity, &record.position(), &summary)
            .await;
        self.locks.release(&identity, guard);
        let attempts = counted?;

        if attempts >= self.policy.max_attempts() {
            warn!(
                identity = %identity,
                attempts = attempts,
                max_attempts = self.policy.max_attempts(),
                error = %summary,
                "Attempts exhausted, routing to dead letter topic"
            );
            return Ok(RouteDecision::DeadLetter {
                attempts,
                reason: summary,
            });
        }

        let delay = self.scheduler.next_delay(attempts, &self.policy)?;
        let topic = self.topology.retry_topic(attempts);

        debug!(
            identity = %identity,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            topic = %topic,
            "Scheduling retry"
        );

        Ok(RouteDecision::Retry {
            attempt: attempts,
            delay,
            topic,
        })
    }

    /// The record was handled successfully
    pub async fn acknowledge(&self, identity: &RecordIdentity) -> Result<()> {
        let guard = self.locks.acquire(identity).await;
        let result = self.tracker.clear(identity).await;
        self.locks.release(identity, guard);
        result
    }

    /// The dead-letter forward succeeded; forget the identity
    pub async fn confirm_dead_letter(&self, identity: &RecordIdentity) -> Result<()> {
        info!(identity = %identity, "Dead letter forward confirmed");
        self.acknowledge(identity).await
    }

    /// The retry copy was published and the source offset committed. The
    /// count now travels in the copy's `x-delivery-attempt` header, so the
    /// local entry is dropped.
    pub async fn hand_off(&self, identity: &RecordIdentity) -> Result<()> {
        debug!(identity = %identity, "Attempt count handed off to retry copy");
        self.acknowledge(identity).await
    }

    /// Build the retry copy for a `Retry` decision
    pub fn redelivery(
        &self,
        record: &InboundRecord,
        failure_summary: &str,
        attempt: u32,
        delay: Duration,
        topic: &str,
    ) -> OutboundRecord {
        let identity = record.identity();
        let not_before = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut headers = record.headers.clone();
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
            attempt.to_string().into_bytes(),
        );
        headers.insert(
            HEADER_RETRY_NOT_BEFORE.to_string(),
            not_before.to_string().into_bytes(),
        );
        headers.insert(
            HEADER_EXCEPTION_MESSAGE.to_string(),
            failure_summary.as_bytes().to_vec(),
        );

        OutboundRecord {
            topic: topic.to_string(),
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers,
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.len()
    }
}
