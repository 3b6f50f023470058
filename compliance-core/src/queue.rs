//! Task Queue & Worker Pool (§4.7): FIFO delivery with late acknowledgement,
//! delayed tasks materialized via `eta` rather than in-process sleeps, and
//! a visibility timeout so a crashed worker's task becomes visible again.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to enqueue task: {0}")]
    Enqueue(String),
    #[error("failed to acknowledge task: {0}")]
    Ack(String),
    #[error("queue is closed")]
    Closed,
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Enqueue(err.to_string())
    }
}

/// Claim payload for the compute queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeTaskPayload {
    pub reference_id: String,
    pub task_id: String,
    pub processing_mode: String,
    pub claim_fields: serde_json::Value,
    pub webhook_url: Option<String>,
    pub correlation_id: String,
}

/// Delivery payload for the webhook queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverTaskPayload {
    pub webhook_id: String,
    pub webhook_url: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

/// Closed tagged-variant task envelope, dispatched by exhaustive match
/// rather than a dynamically looked-up string task name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEnvelope {
    Compute(ComputeTaskPayload),
    Deliver(DeliverTaskPayload),
}

impl TaskEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEnvelope::Compute(_) => "compute",
            TaskEnvelope::Deliver(_) => "deliver",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedTask {
    envelope: TaskEnvelope,
    attempt_count: u32,
}

/// A task handed to a worker, carrying a lease id the worker must use to
/// ack (on success) or nack (on crash-equivalent failure).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub lease_id: String,
    pub envelope: TaskEnvelope,
    pub attempt_count: u32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue_name: &str,
        envelope: TaskEnvelope,
        attempt_count: u32,
        eta: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError>;

    /// Move any delayed tasks whose `eta` has elapsed onto the ready list,
    /// and reclaim any processing tasks whose visibility timeout expired.
    /// Called by `dequeue`, but exposed so a janitor-style loop can also
    /// drive it independently of worker activity.
    async fn tick(&self, queue_name: &str) -> Result<(), QueueError>;

    async fn dequeue(&self, queue_name: &str) -> Result<Option<Delivery>, QueueError>;
    async fn ack(&self, queue_name: &str, lease_id: &str) -> Result<(), QueueError>;
    async fn nack(&self, queue_name: &str, lease_id: &str) -> Result<(), QueueError>;
}

/// Redis-backed queue: a ready list for FIFO delivery, a delayed sorted
/// set keyed by `eta`, and a processing hash + lease-deadline sorted set
/// for visibility-timeout based crash recovery.
pub struct RedisTaskQueue {
    client: redis::Client,
    visibility_timeout: Duration,
}

impl RedisTaskQueue {
    pub fn new(addr: &str, db_index: u8) -> Result<Self, QueueError> {
        let url = format!("{addr}/{db_index}");
        let client = redis::Client::open(url).map_err(|err| QueueError::Enqueue(err.to_string()))?;
        Ok(Self { client, visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    async fn conn(&self) -> Result<redis::aio::Connection, QueueError> {
        let conn = tokio::time::timeout(REDIS_TIMEOUT, self.client.get_async_connection())
            .await
            .map_err(|_| QueueError::Enqueue("connection timed out".to_string()))?
            .map_err(|err| QueueError::Enqueue(err.to_string()))?;
        Ok(conn)
    }

    fn ready_key(queue_name: &str) -> String {
        format!("queue:{queue_name}:ready")
    }
    fn delayed_key(queue_name: &str) -> String {
        format!("queue:{queue_name}:delayed")
    }
    fn processing_key(queue_name: &str) -> String {
        format!("queue:{queue_name}:processing")
    }
    fn lease_deadline_key(queue_name: &str) -> String {
        format!("queue:{queue_name}:lease_deadline")
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        envelope: TaskEnvelope,
        attempt_count: u32,
        eta: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let task = QueuedTask { envelope, attempt_count };
        let body = serde_json::to_string(&task).map_err(|err| QueueError::Enqueue(err.to_string()))?;

        match eta {
            Some(at) if at > Utc::now() => {
                let score = at.timestamp() as f64;
                conn.zadd::<_, _, _, ()>(Self::delayed_key(queue_name), body, score)
                    .await?;
            }
            _ => {
                conn.rpush::<_, _, ()>(Self::ready_key(queue_name), body).await?;
            }
        }
        Ok(())
    }

    async fn tick(&self, queue_name: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp() as f64;

        let due: Vec<String> = conn
            .zrangebyscore(Self::delayed_key(queue_name), f64::NEG_INFINITY, now)
            .await?;
        for body in due {
            let removed: i64 = conn.zrem(Self::delayed_key(queue_name), &body).await?;
            if removed > 0 {
                conn.rpush::<_, _, ()>(Self::ready_key(queue_name), body).await?;
            }
        }

        let now_i = Utc::now().timestamp() as f64;
        let expired_leases: Vec<String> = conn
            .zrangebyscore(Self::lease_deadline_key(queue_name), f64::NEG_INFINITY, now_i)
            .await?;
        for lease_id in expired_leases {
            let body: Option<String> = conn.hget(Self::processing_key(queue_name), &lease_id).await?;
            conn.zrem::<_, _, ()>(Self::lease_deadline_key(queue_name), &lease_id).await?;
            conn.hdel::<_, _, ()>(Self::processing_key(queue_name), &lease_id).await?;
            if let Some(body) = body {
                conn.rpush::<_, _, ()>(Self::ready_key(queue_name), body).await?;
            }
        }
        Ok(())
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<Delivery>, QueueError> {
        self.tick(queue_name).await?;
        let mut conn = self.conn().await?;

        let body: Option<String> = conn.lpop(Self::ready_key(queue_name), None).await?;
        let Some(body) = body else { return Ok(None) };

        let task: QueuedTask = serde_json::from_str(&body).map_err(|err| QueueError::Enqueue(err.to_string()))?;
        let lease_id = Uuid::new_v4().to_string();
        let deadline = (Utc::now() + chrono::Duration::from_std(self.visibility_timeout).unwrap())
            .timestamp() as f64;

        conn.hset::<_, _, _, ()>(Self::processing_key(queue_name), &lease_id, &body).await?;
        conn.zadd::<_, _, _, ()>(Self::lease_deadline_key(queue_name), &lease_id, deadline)
            .await?;

        Ok(Some(Delivery { lease_id, envelope: task.envelope, attempt_count: task.attempt_count }))
    }

    async fn ack(&self, queue_name: &str, lease_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        conn.zrem::<_, _, ()>(Self::lease_deadline_key(queue_name), lease_id)
            .await
            .map_err(|err| QueueError::Ack(err.to_string()))?;
        conn.hdel::<_, _, ()>(Self::processing_key(queue_name), lease_id)
            .await
            .map_err(|err| QueueError::Ack(err.to_string()))?;
        Ok(())
    }

    async fn nack(&self, queue_name: &str, lease_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let body: Option<String> = conn
            .hget(Self::processing_key(queue_name), lease_id)
            .await
            .map_err(|err| QueueError::Ack(err.to_string()))?;
        conn.zrem::<_, _, ()>(Self::lease_deadline_key(queue_name), lease_id).await.ok();
        conn.hdel::<_, _, ()>(Self::processing_key(queue_name), lease_id).await.ok();
        if let Some(body) = body {
            conn.rpush::<_, _, ()>(Self::ready_key(queue_name), body)
                .await
                .map_err(|err| QueueError::Ack(err.to_string()))?;
        }
        Ok(())
    }
}

struct MemoryQueueState {
    ready: VecDeque<QueuedTask>,
    delayed: Vec<(DateTime<Utc>, QueuedTask)>,
    processing: HashMap<String, QueuedTask>,
    lease_deadline: HashMap<String, DateTime<Utc>>,
}

impl Default for MemoryQueueState {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: Vec::new(),
            processing: HashMap::new(),
            lease_deadline: HashMap::new(),
        }
    }
}

/// In-memory FIFO test double, honoring the same ordering, late-ack and
/// visibility timeout contract as the Redis implementation.
pub struct MemoryTaskQueue {
    queues: Mutex<HashMap<String, MemoryQueueState>>,
    visibility_timeout: chrono::Duration,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout: chrono::Duration::from_std(DEFAULT_VISIBILITY_TIMEOUT).unwrap(),
        }
    }

    pub fn with_visibility_timeout(timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout: chrono::Duration::from_std(timeout).unwrap(),
        }
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        envelope: TaskEnvelope,
        attempt_count: u32,
        eta: Option<DateTime<Utc>>,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().expect("poisoned memory queue");
        let state = queues.entry(queue_name.to_string()).or_default();
        let task = QueuedTask { envelope, attempt_count };
        match eta {
            Some(at) if at > Utc::now() => state.delayed.push((at, task)),
            _ => state.ready.push_back(task),
        }
        Ok(())
    }

    async fn tick(&self, queue_name: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().expect("poisoned memory queue");
        let state = queues.entry(queue_name.to_string()).or_default();
        let now = Utc::now();

        let mut still_delayed = Vec::new();
        for (at, task) in state.delayed.drain(..) {
            if at <= now {
                state.ready.push_back(task);
            } else {
                still_delayed.push((at, task));
            }
        }
        state.delayed = still_delayed;

        let expired: Vec<String> = state
            .lease_deadline
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(lease, _)| lease.clone())
            .collect();
        for lease_id in expired {
            state.lease_deadline.remove(&lease_id);
            if let Some(task) = state.processing.remove(&lease_id) {
                state.ready.push_back(task);
            }
        }
        Ok(())
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<Delivery>, QueueError> {
        self.tick(queue_name).await?;
        let mut queues = self.queues.lock().expect("poisoned memory queue");
        let state = queues.entry(queue_name.to_string()).or_default();

        let Some(task) = state.ready.pop_front() else { return Ok(None) };
        let lease_id = Uuid::new_v4().to_string();
        state.lease_deadline.insert(lease_id.clone(), Utc::now() + self.visibility_timeout);
        let delivery = Delivery {
            lease_id: lease_id.clone(),
            envelope: task.envelope.clone(),
            attempt_count: task.attempt_count,
        };
        state.processing.insert(lease_id, task);
        Ok(Some(delivery))
    }

    async fn ack(&self, queue_name: &str, lease_id: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().expect("poisoned memory queue");
        let state = queues.entry(queue_name.to_string()).or_default();
        state.lease_deadline.remove(lease_id);
        state.processing.remove(lease_id);
        Ok(())
    }

    async fn nack(&self, queue_name: &str, lease_id: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().expect("poisoned memory queue");
        let state = queues.entry(queue_name.to_string()).or_default();
        state.lease_deadline.remove(lease_id);
        if let Some(task) = state.processing.remove(lease_id) {
            state.ready.push_back(task);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver_payload(n: u32) -> TaskEnvelope {
        TaskEnvelope::Deliver(DeliverTaskPayload {
            webhook_id: format!("REF{n}_task-{n}"),
            webhook_url: "https://example.com/hook".to_string(),
            payload: serde_json::json!({"n": n}),
            correlation_id: format!("corr-{n}"),
        })
    }

    #[tokio::test]
    async fn fifo_order_preserved_for_ready_tasks() {
        let queue = MemoryTaskQueue::new();
        for n in 0..3 {
            queue.enqueue("webhook_queue", deliver_payload(n), 0, None).await.unwrap();
        }
        for n in 0..3 {
            let delivery = queue.dequeue("webhook_queue").await.unwrap().unwrap();
            match delivery.envelope {
                TaskEnvelope::Deliver(payload) => {
                    assert_eq!(payload.correlation_id, format!("corr-{n}"))
                }
                _ => panic!("expected deliver task"),
            }
            queue.ack("webhook_queue", &delivery.lease_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn delayed_task_invisible_until_eta() {
        let queue = MemoryTaskQueue::new();
        let eta = Utc::now() + chrono::Duration::milliseconds(50);
        queue.enqueue("webhook_queue", deliver_payload(0), 0, Some(eta)).await.unwrap();

        assert!(queue.dequeue("webhook_queue").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.dequeue("webhook_queue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unacked_task_becomes_visible_again_after_visibility_timeout() {
        let queue = MemoryTaskQueue::with_visibility_timeout(Duration::from_millis(30));
        queue.enqueue("webhook_queue", deliver_payload(0), 0, None).await.unwrap();

        let delivery = queue.dequeue("webhook_queue").await.unwrap().unwrap();
        assert!(queue.dequeue("webhook_queue").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let redelivered = queue.dequeue("webhook_queue").await.unwrap();
        assert!(redelivered.is_some());
        assert_ne!(redelivered.unwrap().lease_id, delivery.lease_id);
    }

    #[tokio::test]
    async fn nack_makes_task_immediately_visible_again() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue("webhook_queue", deliver_payload(0), 0, None).await.unwrap();
        let delivery = queue.dequeue("webhook_queue").await.unwrap().unwrap();
        queue.nack("webhook_queue", &delivery.lease_id).await.unwrap();
        assert!(queue.dequeue("webhook_queue").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ack_removes_task_permanently() {
        let queue = MemoryTaskQueue::with_visibility_timeout(Duration::from_millis(20));
        queue.enqueue("webhook_queue", deliver_payload(0), 0, None).await.unwrap();
        let delivery = queue.dequeue("webhook_queue").await.unwrap().unwrap();
        queue.ack("webhook_queue", &delivery.lease_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.dequeue("webhook_queue").await.unwrap().is_none());
    }
}
