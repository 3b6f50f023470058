//! Named records for the webhook delivery core.
//!
//! Per the re-architecture notes, these are explicit structs with typed
//! fields; the core never round-trips a `WebhookRecord` through an
//! untyped JSON map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle state of a webhook delivery, per the state machine in §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    InProgress,
    Retrying,
    Delivered,
    Failed,
}

impl WebhookStatus {
    /// Terminal states freeze `attempts` and set `completed_at`.
    pub fn is_terminal(self) -> bool {
        matches!(self, WebhookStatus::Delivered | WebhookStatus::Failed)
    }
}

/// The primary entity: one webhook delivery's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub reference_id: String,
    pub task_id: String,
    pub webhook_url: String,
    pub status: WebhookStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_code: Option<u16>,
    pub last_error: Option<String>,
    pub correlation_id: String,
    pub payload_digest: String,
    /// Retained only for replay; stripped from some read paths (e.g. the
    /// ingress `/webhook-status` response).
    pub payload: Option<serde_json::Value>,
}

/// `webhook_id = reference_id + "_" + task_id`, computed once and carried
/// alongside the parts rather than re-derived by splitting on `_`
/// (reference ids may themselves contain underscores).
pub fn webhook_id(reference_id: &str, task_id: &str) -> String {
    format!("{reference_id}_{task_id}")
}

impl WebhookRecord {
    pub fn new(
        reference_id: String,
        task_id: String,
        webhook_url: String,
        max_attempts: u32,
        correlation_id: String,
        payload: serde_json::Value,
    ) -> Self {
        let payload_digest = payload_digest(&payload);
        Self {
            reference_id,
            task_id,
            webhook_url,
            status: WebhookStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            last_attempt_at: None,
            completed_at: None,
            response_code: None,
            last_error: None,
            correlation_id,
            payload_digest,
            payload: Some(payload),
        }
    }

    pub fn webhook_id(&self) -> String {
        webhook_id(&self.reference_id, &self.task_id)
    }
}

/// Stable hash of the outbound payload, exposed to receivers as a hint
/// for their own idempotency bookkeeping.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

/// Recorded when a delivery is permanently abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub webhook_id: String,
    pub webhook_url: String,
    pub payload: Option<serde_json::Value>,
    pub error_class: String,
    pub error_detail: String,
    pub attempts: u32,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn key(webhook_id: &str) -> String {
        format!("dead_letter:webhook:{webhook_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_id_joins_reference_and_task() {
        assert_eq!(webhook_id("REF1", "task-abc"), "REF1_task-abc");
    }

    #[test]
    fn payload_digest_is_stable_for_equal_values() {
        let a = serde_json::json!({"a": 1, "b": 2});
        let b = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(payload_digest(&a), payload_digest(&b));
    }

    #[test]
    fn payload_digest_differs_for_different_values() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(payload_digest(&a), payload_digest(&b));
    }

    #[test]
    fn new_record_starts_pending_with_zero_attempts() {
        let record = WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            "https://example.com/hook".to_string(),
            3,
            "corr-1".to_string(),
            serde_json::json!({"ok": true}),
        );
        assert_eq!(record.status, WebhookStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.completed_at.is_none());
        assert_eq!(record.webhook_id(), "REF1_task-1");
    }
}
