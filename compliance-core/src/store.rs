//! Status Store (§4.1): a keyed map from `webhook_id` to `WebhookRecord`,
//! plus a separate namespace for dead-letter entries. The store is the
//! single source of truth for delivery state; the in-memory double below
//! exists only for tests, never as a production fallback.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use thiserror::Error;

use crate::model::{DeadLetterEntry, WebhookRecord, WebhookStatus};

const STATUS_PREFIX: &str = "webhook_status:";
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

const TTL_DELIVERED: Duration = Duration::from_secs(30 * 60);
const TTL_OTHER: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const TTL_DEAD_LETTER: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// TTL to apply on write, per the lifecycle rules in §3.
pub fn ttl_for_status(status: WebhookStatus) -> Duration {
    match status {
        WebhookStatus::Delivered => TTL_DELIVERED,
        _ => TTL_OTHER,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    IOError(String),
    #[error("failed to serialize or deserialize record: {0}")]
    Serialization(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::IOError(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Optional filter applied when scanning or bulk-deleting records.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub reference_id_prefix: Option<String>,
    pub status: Option<WebhookStatus>,
}

impl ScanFilter {
    fn matches(&self, record: &WebhookRecord) -> bool {
        if let Some(prefix) = &self.reference_id_prefix {
            if !record.reference_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// A page of scanned records, with a best-effort total per §4.1.
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub items: Vec<WebhookRecord>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn put(&self, record: &WebhookRecord) -> Result<(), StoreError>;
    async fn get(&self, webhook_id: &str) -> Result<Option<WebhookRecord>, StoreError>;
    async fn delete(&self, webhook_id: &str) -> Result<bool, StoreError>;
    async fn scan(&self, filter: ScanFilter, page: u32, page_size: u32) -> Result<ScanPage, StoreError>;
    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;
    async fn get_dead_letter(&self, webhook_id: &str) -> Result<Option<DeadLetterEntry>, StoreError>;
    async fn bulk_delete(&self, filter: ScanFilter, older_than: Duration) -> Result<u64, StoreError>;
    /// Cheap reachability probe, used by the health surface.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed implementation, mirroring the `Client` trait-object
/// pattern used for the flag store's Redis wrapper.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(addr: &str, db_index: u8) -> Result<Self, StoreError> {
        let url = format!("{addr}/{db_index}");
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::Connection, StoreError> {
        let conn = tokio::time::timeout(REDIS_TIMEOUT, self.client.get_async_connection())
            .await
            .map_err(|_| StoreError::IOError("connection timed out".to_string()))??;
        Ok(conn)
    }

    fn key(webhook_id: &str) -> String {
        format!("{STATUS_PREFIX}{webhook_id}")
    }
}

#[async_trait]
impl StatusStore for RedisStore {
    async fn put(&self, record: &WebhookRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = Self::key(&record.webhook_id());
        let body = serde_json::to_string(record)?;
        let ttl = ttl_for_status(record.status).as_secs();
        let fut = conn.set_ex::<_, _, ()>(key, body, ttl);
        tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("put timed out".to_string()))??;
        Ok(())
    }

    async fn get(&self, webhook_id: &str) -> Result<Option<WebhookRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let key = Self::key(webhook_id);
        let fut = conn.get::<_, Option<String>>(key);
        let raw = tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("get timed out".to_string()))??;
        match raw {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, webhook_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let key = Self::key(webhook_id);
        let fut = conn.del::<_, i64>(key);
        let removed = tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("delete timed out".to_string()))??;
        Ok(removed > 0)
    }

    async fn scan(&self, filter: ScanFilter, page: u32, page_size: u32) -> Result<ScanPage, StoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{STATUS_PREFIX}*");
        let fut = conn.scan_match::<_, String>(pattern);
        let mut iter = tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("scan timed out".to_string()))??;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        drop(iter);

        let mut matched = Vec::new();
        for key in keys {
            let raw: Option<String> = conn.get(&key).await.ok();
            if let Some(body) = raw {
                if let Ok(record) = serde_json::from_str::<WebhookRecord>(&body) {
                    if filter.matches(&record) {
                        matched.push(record);
                    }
                }
            }
        }

        let total = matched.len() as u64;
        let start = (page.saturating_sub(1) as usize) * page_size as usize;
        let items = matched.into_iter().skip(start).take(page_size as usize).collect();
        Ok(ScanPage { items, page, page_size, total })
    }

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = DeadLetterEntry::key(&entry.webhook_id);
        let body = serde_json::to_string(entry)?;
        let fut = conn.set_ex::<_, _, ()>(key, body, TTL_DEAD_LETTER.as_secs());
        tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("put_dead_letter timed out".to_string()))??;
        Ok(())
    }

    async fn get_dead_letter(&self, webhook_id: &str) -> Result<Option<DeadLetterEntry>, StoreError> {
        let mut conn = self.conn().await?;
        let key = DeadLetterEntry::key(webhook_id);
        let fut = conn.get::<_, Option<String>>(key);
        let raw = tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("get_dead_letter timed out".to_string()))??;
        match raw {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn bulk_delete(&self, filter: ScanFilter, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let page = self.scan(filter, 1, u32::MAX).await?;
        let mut deleted = 0u64;
        for record in page.items {
            if record.created_at < cutoff && self.delete(&record.webhook_id()).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let fut = redis::cmd("PING").query_async::<_, String>(&mut conn);
        tokio::time::timeout(REDIS_TIMEOUT, fut)
            .await
            .map_err(|_| StoreError::IOError("ping timed out".to_string()))??;
        Ok(())
    }
}

/// In-memory test double implementing the same contract, per the
/// "process-wide in-memory status fallback: forbid" design note — this
/// exists only under `#[cfg(test)]`-adjacent test code, never wired into
/// a binary's composition root.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, WebhookRecord>>,
    dead_letters: RwLock<HashMap<String, DeadLetterEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn put(&self, record: &WebhookRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("poisoned memory store");
        records.insert(record.webhook_id(), record.clone());
        Ok(())
    }

    async fn get(&self, webhook_id: &str) -> Result<Option<WebhookRecord>, StoreError> {
        let records = self.records.read().expect("poisoned memory store");
        Ok(records.get(webhook_id).cloned())
    }

    async fn delete(&self, webhook_id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().expect("poisoned memory store");
        Ok(records.remove(webhook_id).is_some())
    }

    async fn scan(&self, filter: ScanFilter, page: u32, page_size: u32) -> Result<ScanPage, StoreError> {
        let records = self.records.read().expect("poisoned memory store");
        let mut matched: Vec<WebhookRecord> =
            records.values().filter(|r| filter.matches(r)).cloned().collect();
        matched.sort_by_key(|r| r.created_at);
        let total = matched.len() as u64;
        let start = (page.saturating_sub(1) as usize) * page_size as usize;
        let items = matched.into_iter().skip(start).take(page_size as usize).collect();
        Ok(ScanPage { items, page, page_size, total })
    }

    async fn put_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let mut letters = self.dead_letters.write().expect("poisoned memory store");
        letters.insert(entry.webhook_id.clone(), entry.clone());
        Ok(())
    }

    async fn get_dead_letter(&self, webhook_id: &str) -> Result<Option<DeadLetterEntry>, StoreError> {
        let letters = self.dead_letters.read().expect("poisoned memory store");
        Ok(letters.get(webhook_id).cloned())
    }

    async fn bulk_delete(&self, filter: ScanFilter, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let to_delete: Vec<String> = {
            let records = self.records.read().expect("poisoned memory store");
            records
                .values()
                .filter(|r| filter.matches(r) && r.created_at < cutoff)
                .map(|r| r.webhook_id())
                .collect()
        };
        let mut records = self.records.write().expect("poisoned memory store");
        let mut deleted = 0u64;
        for id in to_delete {
            if records.remove(&id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(reference_id: &str, status: WebhookStatus) -> WebhookRecord {
        let mut record = WebhookRecord::new(
            reference_id.to_string(),
            "task-1".to_string(),
            "https://example.com/hook".to_string(),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        record.status = status;
        record
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStore::new();
        let record = sample("REF1", WebhookStatus::Pending);
        store.put(&record).await.unwrap();
        let fetched = store.get(&record.webhook_id()).await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_record_existed() {
        let store = MemoryStore::new();
        let record = sample("REF1", WebhookStatus::Pending);
        store.put(&record).await.unwrap();
        assert!(store.delete(&record.webhook_id()).await.unwrap());
        assert!(!store.delete(&record.webhook_id()).await.unwrap());
    }

    #[tokio::test]
    async fn scan_filters_by_status_and_reference_prefix() {
        let store = MemoryStore::new();
        store.put(&sample("REF1", WebhookStatus::Delivered)).await.unwrap();
        store.put(&sample("REF2", WebhookStatus::Pending)).await.unwrap();

        let page = store
            .scan(
                ScanFilter { reference_id_prefix: None, status: Some(WebhookStatus::Delivered) },
                1,
                10,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].reference_id, "REF1");
    }

    #[tokio::test]
    async fn dead_letter_roundtrips() {
        let store = MemoryStore::new();
        let entry = DeadLetterEntry {
            webhook_id: "REF1_task-1".to_string(),
            webhook_url: "https://example.com/hook".to_string(),
            payload: Some(json!({"ok": false})),
            error_class: "server_5xx".to_string(),
            error_detail: "503".to_string(),
            attempts: 3,
            correlation_id: "corr-1".to_string(),
            created_at: Utc::now(),
        };
        store.put_dead_letter(&entry).await.unwrap();
        let fetched = store.get_dead_letter(&entry.webhook_id).await.unwrap().unwrap();
        assert_eq!(fetched.error_class, "server_5xx");
    }

    #[tokio::test]
    async fn idempotent_cleanup_returns_zero_on_second_run() {
        let store = MemoryStore::new();
        let mut old = sample("REF1", WebhookStatus::Failed);
        old.created_at = Utc::now() - chrono::Duration::days(10);
        store.put(&old).await.unwrap();

        let first = store
            .bulk_delete(ScanFilter::default(), Duration::from_secs(7 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(first, 1);

        let second = store
            .bulk_delete(ScanFilter::default(), Duration::from_secs(7 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn ttl_matches_lifecycle_rules() {
        assert_eq!(ttl_for_status(WebhookStatus::Delivered), TTL_DELIVERED);
        assert_eq!(ttl_for_status(WebhookStatus::Failed), TTL_OTHER);
        assert_eq!(ttl_for_status(WebhookStatus::Pending), TTL_OTHER);
    }
}
