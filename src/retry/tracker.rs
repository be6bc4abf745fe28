//! Attempt tracking
//!
//! Counts failed attempts per message identity. A delivery is counted at most
//! once: when the same physical delivery fails again (because a redelivery
//! publish or dead-letter forward failed and the broker handed it back), the
//! stored count is returned unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{DeliveryPosition, RecordIdentity};

/// Tracking state of one message identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Failed attempts so far
    pub attempt_count: u32,

    /// First time a failure was recorded
    pub first_seen_at: DateTime<Utc>,

    /// Last time a failure was recorded
    pub last_attempt_at: DateTime<Utc>,

    /// Summary of the last failure
    pub last_error: Option<String>,

    /// The delivery whose failure was counted last
    pub last_delivery: Option<DeliveryPosition>,
}

impl AttemptRecord {
    fn new(attempt_count: u32) -> Self {
        let now = Utc::now();
        Self {
            attempt_count,
            first_seen_at: now,
            last_attempt_at: now,
            last_error: None,
            last_delivery: None,
        }
    }
}

/// Per-identity attempt counter
#[async_trait]
pub trait AttemptTracker: Send + Sync {
    /// Count a failure of `delivery` and return the new attempt count
    async fn record_failure(
        &self,
        identity: &RecordIdentity,
        delivery: &DeliveryPosition,
        error: &str,
    ) -> Result<u32>;

    /// Failed attempts recorded for `identity` (0 if untracked)
    async fn current_attempts(&self, identity: &RecordIdentity) -> Result<u32>;

    /// Raise the stored count to at least `attempts`
    async fn restore(&self, identity: &RecordIdentity, attempts: u32) -> Result<()>;

    /// Drop tracking state; absent identities are a no-op
    async fn clear(&self, identity: &RecordIdentity) -> Result<()>;

    /// Copy of the tracking state of `identity`
    async fn snapshot(&self, identity: &RecordIdentity) -> Result<Option<AttemptRecord>>;

    /// Number of tracked identities
    async fn tracked(&self) -> Result<usize>;
}

/// The map both trackers share; mutations report whether anything changed
#[derive(Debug, Default)]
struct AttemptTable {
    entries: HashMap<RecordIdentity, AttemptRecord>,
}

impl AttemptTable {
    fn record_failure(
        &mut self,
        identity: &RecordIdentity,
        delivery: &DeliveryPosition,
        error: &str,
    ) -> u32 {
        let entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| AttemptRecord::new(0));

        entry.last_attempt_at = Utc::now();
        entry.last_error = Some(error.to_string());

        if entry.last_delivery.as_ref() == Some(delivery) {
            debug!(
                identity = %identity,
                delivery = %delivery,
                attempts = entry.attempt_count,
                "Failure of an already counted delivery"
            );
            return entry.attempt_count;
        }

        entry.attempt_count = entry.attempt_count.saturating_add(1);
        entry.last_delivery = Some(delivery.clone());
        entry.attempt_count
    }

    fn current_attempts(&self, identity: &RecordIdentity) -> u32 {
        self.entries
            .get(identity)
            .map(|r| r.attempt_count)
            .unwrap_or(0)
    }

    fn restore(&mut self, identity: &RecordIdentity, attempts: u32) -> bool {
        if attempts == 0 {
            return false;
        }

        let entry = self
            .entries
            .entry(identity.clone())
            .or_insert_with(|| AttemptRecord::new(0));

        if entry.attempt_count >= attempts {
            return false;
        }
        entry.attempt_count = attempts;
        true
    }

    fn clear(&mut self, identity: &RecordIdentity) -> bool {
        self.entries.remove(identity).is_some()
    }
}

/// Attempt tracker kept in process memory.
///
/// Retry copies carry their attempt count in headers, so a restart loses only
/// the counts of deliveries that failed but were never republished.
#[derive(Debug, Default)]
pub struct InMemoryAttemptTracker {
    table: Mutex<AttemptTable>,
}

impl InMemoryAttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AttemptTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AttemptTracker for InMemoryAttemptTracker {
    async fn record_failure(
        &self,
        identity: &RecordIdentity,
        delivery: &DeliveryPosition,
        error: &str,
    ) -> Result<u32> {
        Ok(self.lock().record_failure(identity, delivery, error))
    }

    async fn current_attempts(&self, identity: &RecordIdentity) -> Result<u32> {
        Ok(self.lock().current_attempts(identity))
    }

    async fn restore(&self, identity: &RecordIdentity, attempts: u32) -> Result<()> {
        self.lock().restore(identity, attempts);
        Ok(())
    }

    async fn clear(&self, identity: &RecordIdentity) -> Result<()> {
        self.lock().clear(identity);
        Ok(())
    }

    async fn snapshot(&self, identity: &RecordIdentity) -> Result<Option<AttemptRecord>> {
        Ok(self.lock().entries.get(identity).cloned())
    }

    async fn tracked(&self) -> Result<usize> {
        Ok(self.lock().entries.len())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAttempt {
    identity: RecordIdentity,
    #[serde(flatten)]
    record: AttemptRecord,
}

/// Attempt tracker that persists its table to a JSON file after every change
#[derive(Debug)]
pub struct FileAttemptTracker {
    path: PathBuf,
    table: tokio::sync::Mutex<AttemptTable>,
}

impl FileAttemptTracker {
    /// Open the tracker, loading an existing snapshot if present
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut table = AttemptTable::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                let stored: Vec<StoredAttempt> = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::tracker(format!(
                        "corrupt attempt store {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                for entry in stored {
                    table.entries.insert(entry.identity, entry.record);
                }
            },
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(Error::Io(e)),
        }

        info!(
            path = %path.display(),
            tracked = table.entries.len(),
            "Attempt store opened"
        );

        Ok(Self {
            path,
            table: tokio::sync::Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &AttemptTable) -> Result<()> {
        let mut stored: Vec<StoredAttempt> = table
            .entries
            .iter()
            .map(|(identity, record)| StoredAttempt {
                identity: identity.clone(),
                record: record.clone(),
            })
            .collect();
        stored.sort_by(|a, b| a.identity.cmp(&b.identity));

        let bytes = serde_json::to_vec_pretty(&stored)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AttemptTracker for FileAttemptTracker {
    async fn record_failure(
        &self,
        identity: &RecordIdentity,
        delivery: &DeliveryPosition,
        error: &str,
    ) -> Result<u32> {
        let mut table = self.table.lock().await;
        let count = table.record_failure(identity, delivery, error);
        self.persist(&table).await?;
        Ok(count)
    }

    async fn current_attempts(&self, identity: &RecordIdentity) -> Result<u32> {
        Ok(self.table.lock().await.current_attempts(identity))
    }

    async fn restore(&self, identity: &RecordIdentity, attempts: u32) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.restore(identity, attempts) {
            self.persist(&table).await?;
        }
        Ok(())
    }

    async fn clear(&self, identity: &RecordIdentity) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.clear(identity) {
            self.persist(&table).await?;
        }
        Ok(())
    }

    async fn snapshot(&self, identity: &RecordIdentity) -> Result<Option<AttemptRecord>> {
        Ok(self.table.lock().await.entries.get(identity).cloned())
    }

    async fn tracked(&self) -> Result<usize> {
        Ok(self.table.lock().await.entries.len())
    }
}
