//! Status Lifecycle Manager (§4.8): the single entry point for status
//! mutations. Enforces the state machine, assigns TTL on every write (via
//! the store), and exposes listing/filter/pagination and cleanup.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{DeadLetterEntry, WebhookRecord, WebhookStatus};
use crate::store::{ScanFilter, ScanPage, StatusStore, StoreError};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("illegal transition from {from:?} to {to:?} for webhook {webhook_id}")]
    Illegal { webhook_id: String, from: WebhookStatus, to: WebhookStatus },
    #[error("no record found for webhook {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `(from, to)` pairs allowed by the state machine in §4.5. Terminal
/// states (`delivered`, `failed`) accept no further transition.
fn transition_allowed(from: WebhookStatus, to: WebhookStatus) -> bool {
    use WebhookStatus::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Delivered)
            | (InProgress, Retrying)
            | (InProgress, Failed)
            | (Retrying, InProgress)
            | (Retrying, Failed)
    )
}

/// Single entry-point for all `WebhookRecord` mutations.
pub struct LifecycleManager {
    store: Arc<dyn StatusStore>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, record: WebhookRecord) -> Result<(), TransitionError> {
        self.store.put(&record).await?;
        Ok(())
    }

    pub async fn get(&self, webhook_id: &str) -> Result<Option<WebhookRecord>, TransitionError> {
        Ok(self.store.get(webhook_id).await?)
    }

    /// Apply `mutate` to the current record after checking the transition
    /// it produces is legal, then persist. A stale concurrent write (the
    /// record changed between read and write) is retried once.
    pub async fn transition<F>(&self, webhook_id: &str, mutate: F) -> Result<WebhookRecord, TransitionError>
    where
        F: Fn(&mut WebhookRecord),
    {
        for attempt in 0..2 {
            let Some(mut record) = self.store.get(webhook_id).await? else {
                return Err(TransitionError::NotFound(webhook_id.to_string()));
            };
            let before = record.status;
            mutate(&mut record);
            let after = record.status;

            if before != after && !transition_allowed(before, after) {
                return Err(TransitionError::Illegal {
                    webhook_id: webhook_id.to_string(),
                    from: before,
                    to: after,
                });
            }

            if after.is_terminal() && record.completed_at.is_none() {
                record.completed_at = Some(Utc::now());
            }

            match self.store.put(&record).await {
                Ok(()) => return Ok(record),
                Err(err) if attempt == 0 => {
                    warn!(webhook_id, error = %err, "stale write, retrying once");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("loop always returns within two attempts")
    }

    pub async fn delete(&self, webhook_id: &str) -> Result<bool, TransitionError> {
        Ok(self.store.delete(webhook_id).await?)
    }

    pub async fn list(&self, filter: ScanFilter, page: u32, page_size: u32) -> Result<ScanPage, TransitionError> {
        Ok(self.store.scan(filter, page, page_size).await?)
    }

    pub async fn write_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), TransitionError> {
        self.store.put_dead_letter(&entry).await?;
        Ok(())
    }

    /// Idempotent cleanup-by-age: a second run with the same parameters
    /// deletes nothing, since the first run already removed every
    /// matching record.
    pub async fn cleanup(&self, filter: ScanFilter, older_than: Duration) -> Result<u64, TransitionError> {
        let deleted = self.store.bulk_delete(filter, older_than).await?;
        info!(deleted, "webhook status cleanup completed");
        Ok(deleted)
    }
}
