//! Compute Task (§4.6): invokes the pluggable compute function with a
//! per-task timeout, classifies failures, retries transient ones with
//! its own bounded-backoff policy, and on success or final failure hands
//! the result to the delivery pipeline when a `webhook_url` was given.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::lifecycle::LifecycleManager;
use crate::model::WebhookRecord;
use crate::queue::{ComputeTaskPayload, DeliverTaskPayload, TaskEnvelope, TaskQueue};
use crate::retry::RetryPolicy;

const DEFAULT_COMPUTE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Error returned by a pluggable compute function: transient failures are
/// retried, permanent ones fail the task immediately.
#[derive(Debug, Error, Clone)]
pub enum ComputeError {
    #[error("transient compute failure: {0}")]
    Transient(String),
    #[error("permanent compute failure: {0}")]
    Permanent(String),
}

/// The pluggable unit of work. `processing_mode` and `claim_fields` are
/// forwarded opaquely; the core never inspects them.
#[async_trait]
pub trait ComputeFunction: Send + Sync {
    async fn execute(&self, payload: &ComputeTaskPayload) -> Result<serde_json::Value, ComputeError>;
}

/// Externally observable task state, surfaced at `GET /task-status/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub reference_id: String,
    pub status: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TaskStatusError {
    #[error("task status backend error: {0}")]
    IOError(String),
}

impl From<redis::RedisError> for TaskStatusError {
    fn from(err: redis::RedisError) -> Self {
        TaskStatusError::IOError(err.to_string())
    }
}

/// Separate, smaller namespace from the webhook status store: one record
/// per compute task, independent of whether a webhook was requested.
#[async_trait]
pub trait TaskStatusStore: Send + Sync {
    async fn put(&self, record: &TaskStatusRecord) -> Result<(), TaskStatusError>;
    async fn get(&self, task_id: &str) -> Result<Option<TaskStatusRecord>, TaskStatusError>;
}

pub struct RedisTaskStatusStore {
    client: redis::Client,
}

impl RedisTaskStatusStore {
    pub fn new(addr: &str, db_index: u8) -> Result<Self, TaskStatusError> {
        let url = format!("{addr}/{db_index}");
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    fn key(task_id: &str) -> String {
        format!("task_status:{task_id}")
    }
}

#[async_trait]
impl TaskStatusStore for RedisTaskStatusStore {
    async fn put(&self, record: &TaskStatusRecord) -> Result<(), TaskStatusError> {
        let mut conn = self.client.get_async_connection().await?;
        let body = serde_json::to_string(record).map_err(|err| TaskStatusError::IOError(err.to_string()))?;
        conn.set_ex::<_, _, ()>(Self::key(&record.task_id), body, 7 * 24 * 60 * 60).await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskStatusRecord>, TaskStatusError> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = conn.get(Self::key(task_id)).await?;
        match raw {
            Some(body) => Ok(Some(
                serde_json::from_str(&body).map_err(|err| TaskStatusError::IOError(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
pub struct MemoryTaskStatusStore {
    records: RwLock<HashMap<String, TaskStatusRecord>>,
}

impl MemoryTaskStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStatusStore for MemoryTaskStatusStore {
    async fn put(&self, record: &TaskStatusRecord) -> Result<(), TaskStatusError> {
        let mut records = self.records.write().expect("poisoned memory task status store");
        records.insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskStatusRecord>, TaskStatusError> {
        let records = self.records.read().expect("poisoned memory task status store");
        Ok(records.get(task_id).cloned())
    }
}

pub struct ComputeTaskRunner {
    compute_fn: std::sync::Arc<dyn ComputeFunction>,
    task_status: std::sync::Arc<dyn TaskStatusStore>,
    lifecycle: std::sync::Arc<LifecycleManager>,
    queue: std::sync::Arc<dyn TaskQueue>,
    compute_queue_name: String,
    delivery_queue_name: String,
    timeout: Duration,
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl ComputeTaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compute_fn: std::sync::Arc<dyn ComputeFunction>,
        task_status: std::sync::Arc<dyn TaskStatusStore>,
        lifecycle: std::sync::Arc<LifecycleManager>,
        queue: std::sync::Arc<dyn TaskQueue>,
        compute_queue_name: impl Into<String>,
        delivery_queue_name: impl Into<String>,
        retry_policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            compute_fn,
            task_status,
            lifecycle,
            queue,
            compute_queue_name: compute_queue_name.into(),
            delivery_queue_name: delivery_queue_name.into(),
            timeout: DEFAULT_COMPUTE_TIMEOUT,
            retry_policy,
            max_attempts,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn webhook_id(payload: &ComputeTaskPayload) -> String {
        crate::model::webhook_id(&payload.reference_id, &payload.task_id)
    }

    /// Run one invocation of the compute task. `attempt_count` is the
    /// number of prior attempts, carried on the queue envelope.
    pub async fn execute(
        &self,
        payload: ComputeTaskPayload,
        attempt_count: u32,
    ) -> Result<(), crate::queue::QueueError> {
        self.task_status
            .put(&TaskStatusRecord {
                task_id: payload.task_id.clone(),
                reference_id: payload.reference_id.clone(),
                status: TaskState::Processing,
                result: None,
                error: None,
                updated_at: Utc::now(),
            })
            .await
            .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?;

        let outcome = tokio::time::timeout(self.timeout, self.compute_fn.execute(&payload)).await;

        match outcome {
            Ok(Ok(result)) => self.on_success(payload, result).await,
            Ok(Err(err)) => self.on_failure(payload, attempt_count, err).await,
            Err(_) => {
                self.on_failure(payload.clone(), attempt_count, ComputeError::Transient("timeout".to_string()))
                    .await
            }
        }
    }

    async fn on_success(
        &self,
        payload: ComputeTaskPayload,
        result: serde_json::Value,
    ) -> Result<(), crate::queue::QueueError> {
        info!(task_id = %payload.task_id, "compute task completed");
        self.task_status
            .put(&TaskStatusRecord {
                task_id: payload.task_id.clone(),
                reference_id: payload.reference_id.clone(),
                status: TaskState::Completed,
                result: Some(result.clone()),
                error: None,
                updated_at: Utc::now(),
            })
            .await
            .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?;

        if let Some(webhook_url) = payload.webhook_url.clone() {
            self.dispatch_delivery(&payload, webhook_url, result).await?;
        }
        Ok(())
    }

    async fn on_failure(
        &self,
        payload: ComputeTaskPayload,
        attempt_count: u32,
        err: ComputeError,
    ) -> Result<(), crate::queue::QueueError> {
        let attempts = attempt_count + 1;
        let (detail, transient) = match &err {
            ComputeError::Transient(detail) => (detail.clone(), true),
            ComputeError::Permanent(detail) => (detail.clone(), false),
        };

        if transient && attempts < self.max_attempts {
            warn!(task_id = %payload.task_id, attempts, "compute task failed transiently, scheduling retry");
            self.task_status
                .put(&TaskStatusRecord {
                    task_id: payload.task_id.clone(),
                    reference_id: payload.reference_id.clone(),
                    status: TaskState::Retrying,
                    result: None,
                    error: Some(detail),
                    updated_at: Utc::now(),
                })
                .await
                .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?;

            let delay = self.retry_policy.jittered_delay(attempts.saturating_sub(1));
            let eta = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            self.queue
                .enqueue(&self.compute_queue_name, TaskEnvelope::Compute(payload), attempts, Some(eta))
                .await?;
            return Ok(());
        }

        warn!(task_id = %payload.task_id, attempts, "compute task failed permanently");
        self.task_status
            .put(&TaskStatusRecord {
                task_id: payload.task_id.clone(),
                reference_id: payload.reference_id.clone(),
                status: TaskState::Failed,
                result: None,
                error: Some(detail.clone()),
                updated_at: Utc::now(),
            })
            .await
            .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?;

        if let Some(webhook_url) = payload.webhook_url.clone() {
            let synthetic = serde_json::json!({
                "task_id": payload.task_id,
                "reference_id": payload.reference_id,
                "error": detail,
            });
            self.dispatch_delivery(&payload, webhook_url, synthetic).await?;
        }
        Ok(())
    }

    async fn dispatch_delivery(
        &self,
        payload: &ComputeTaskPayload,
        webhook_url: String,
        result: serde_json::Value,
    ) -> Result<(), crate::queue::QueueError> {
        let webhook_id = Self::webhook_id(payload);

        if let Some(existing) = self
            .lifecycle
            .get(&webhook_id)
            .await
            .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?
        {
            let mut record = existing;
            record.payload = Some(result.clone());
            record.payload_digest = crate::model::payload_digest(&result);
            self.lifecycle
                .create(record)
                .await
                .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?;
        } else {
            let record = WebhookRecord::new(
                payload.reference_id.clone(),
                payload.task_id.clone(),
                webhook_url.clone(),
                3,
                payload.correlation_id.clone(),
                result.clone(),
            );
            self.lifecycle
                .create(record)
                .await
                .map_err(|err| crate::queue::QueueError::Enqueue(err.to_string()))?;
        }

        self.queue
            .enqueue(
                &self.delivery_queue_name,
                TaskEnvelope::Deliver(DeliverTaskPayload {
                    webhook_id,
                    webhook_url,
                    payload: result,
                    correlation_id: payload.correlation_id.clone(),
                }),
                0,
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    struct AlwaysSucceeds;
    #[async_trait]
    impl ComputeFunction for AlwaysSucceeds {
        async fn execute(&self, payload: &ComputeTaskPayload) -> Result<serde_json::Value, ComputeError> {
            Ok(serde_json::json!({"reference_id": payload.reference_id, "ok": true}))
        }
    }

    struct AlwaysTransient;
    #[async_trait]
    impl ComputeFunction for AlwaysTransient {
        async fn execute(&self, _payload: &ComputeTaskPayload) -> Result<serde_json::Value, ComputeError> {
            Err(ComputeError::Transient("downstream unavailable".to_string()))
        }
    }

    struct AlwaysPermanent;
    #[async_trait]
    impl ComputeFunction for AlwaysPermanent {
        async fn execute(&self, _payload: &ComputeTaskPayload) -> Result<serde_json::Value, ComputeError> {
            Err(ComputeError::Permanent("invalid claim".to_string()))
        }
    }

    fn payload(webhook_url: Option<&str>) -> ComputeTaskPayload {
        ComputeTaskPayload {
            reference_id: "REF1".to_string(),
            task_id: "task-1".to_string(),
            processing_mode: "basic".to_string(),
            claim_fields: serde_json::json!({}),
            webhook_url: webhook_url.map(|s| s.to_string()),
            correlation_id: "corr-1".to_string(),
        }
    }

    fn runner(compute_fn: Arc<dyn ComputeFunction>) -> (ComputeTaskRunner, Arc<LifecycleManager>) {
        let lifecycle = Arc::new(LifecycleManager::new(Arc::new(MemoryStore::new())));
        let queue: Arc<dyn TaskQueue> = Arc::new(crate::queue::MemoryTaskQueue::new());
        let runner = ComputeTaskRunner::new(
            compute_fn,
            Arc::new(MemoryTaskStatusStore::new()),
            lifecycle.clone(),
            queue,
            "compute_queue",
            "webhook_queue",
            RetryPolicy::default(),
            3,
        );
        (runner, lifecycle)
    }

    #[tokio::test]
    async fn success_creates_webhook_record_with_result_payload() {
        let (runner, lifecycle) = runner(Arc::new(AlwaysSucceeds));
        runner.execute(payload(Some("https://example.com/hook")), 0).await.unwrap();

        let record = lifecycle.get("REF1_task-1").await.unwrap().unwrap();
        assert_eq!(record.payload.unwrap()["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn success_without_webhook_url_does_not_create_record() {
        let (runner, lifecycle) = runner(Arc::new(AlwaysSucceeds));
        runner.execute(payload(None), 0).await.unwrap();
        assert!(lifecycle.get("REF1_task-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn permanent_failure_delivers_synthetic_error_payload() {
        let (runner, lifecycle) = runner(Arc::new(AlwaysPermanent));
        runner.execute(payload(Some("https://example.com/hook")), 2).await.unwrap();

        let record = lifecycle.get("REF1_task-1").await.unwrap().unwrap();
        assert_eq!(record.payload.unwrap()["error"], serde_json::json!("invalid claim"));
    }

    #[tokio::test]
    async fn transient_failure_below_max_attempts_does_not_create_webhook_record_yet() {
        let (runner, lifecycle) = runner(Arc::new(AlwaysTransient));
        runner.execute(payload(Some("https://example.com/hook")), 0).await.unwrap();
        assert!(lifecycle.get("REF1_task-1").await.unwrap().is_none());
    }
}
