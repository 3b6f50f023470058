//! Webhook Delivery Task (§4.5): the orchestrator that drives one
//! `webhook_id` through the delivery state machine for a single
//! invocation — read, in-progress, validate, breaker-gated HTTP call,
//! classify, retry-or-terminate.

use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::delivery::{validate_url, DeliveryClient, DeliveryError};
use crate::lifecycle::{LifecycleManager, TransitionError};
use crate::model::{DeadLetterEntry, WebhookStatus};
use crate::queue::{DeliverTaskPayload, TaskEnvelope, TaskQueue};
use crate::retry::{OutcomeClass, RetryDecision, RetryPolicy};

#[derive(Debug, Error)]
pub enum DeliveryTaskError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

pub struct WebhookDeliveryTask {
    lifecycle: Arc<LifecycleManager>,
    breaker: Arc<CircuitBreakerRegistry>,
    client: Arc<DeliveryClient>,
    retry_policy: RetryPolicy,
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    allow_private_destinations: bool,
    allowlist: Option<Regex>,
}

impl WebhookDeliveryTask {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        breaker: Arc<CircuitBreakerRegistry>,
        client: Arc<DeliveryClient>,
        retry_policy: RetryPolicy,
        queue: Arc<dyn TaskQueue>,
        queue_name: impl Into<String>,
        allow_private_destinations: bool,
        allowlist: Option<Regex>,
    ) -> Self {
        Self {
            lifecycle,
            breaker,
            client,
            retry_policy,
            queue,
            queue_name: queue_name.into(),
            allow_private_destinations,
            allowlist,
        }
    }

    fn destination_host(url: &url::Url) -> String {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("unknown");
        match url.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        }
    }

    /// Run one invocation of the delivery task for `webhook_id`.
    pub async fn execute(&self, webhook_id: &str) -> Result<(), DeliveryTaskError> {
        let Some(record) = self.lifecycle.get(webhook_id).await? else {
            info!(webhook_id, "delivery task invoked for missing record, skipping");
            return Ok(());
        };
        if record.status.is_terminal() {
            info!(webhook_id, status = ?record.status, "delivery task invoked on terminal record, skipping");
            return Ok(());
        }

        let record = self
            .lifecycle
            .transition(webhook_id, |r| {
                r.status = WebhookStatus::InProgress;
                r.last_attempt_at = Some(chrono::Utc::now());
                r.attempts += 1;
            })
            .await?;

        let parsed_url = match validate_url(
            &record.webhook_url,
            self.allow_private_destinations,
            self.allowlist.as_ref(),
        ) {
            Ok(url) => url,
            Err(DeliveryError::InvalidUrl(detail)) => {
                self.fail_permanent(webhook_id, None, OutcomeClass::InvalidUrl, &detail).await?;
                return Ok(());
            }
            Err(other) => {
                self.fail_permanent(webhook_id, None, OutcomeClass::InvalidUrl, &other.to_string())
                    .await?;
                return Ok(());
            }
        };

        let host = Self::destination_host(&parsed_url);
        let body = serde_json::to_vec(&record.payload.clone().unwrap_or(serde_json::Value::Null))
            .unwrap_or_default();

        let started = Instant::now();
        let (class, status_code, detail) = match self.breaker.check(&host) {
            Ok(()) => {
                let outcome = self
                    .client
                    .deliver(&record.webhook_url, webhook_id, &record.correlation_id, record.attempts, &body)
                    .await;
                self.breaker.record_outcome(&host, outcome.class);
                (outcome.class, outcome.status_code, outcome.detail)
            }
            Err(circuit_open) => {
                warn!(webhook_id, host, "circuit open, short-circuiting delivery attempt");
                (OutcomeClass::ConnectionError, None, "circuit_open".to_string())
            }
        };
        let elapsed = started.elapsed();

        let host_label = [("host", host.clone())];
        metrics::histogram!("webhook_delivery_seconds", &host_label).record(elapsed.as_secs_f64());
        metrics::gauge!("circuit_breaker_status", &host_label).set(self.breaker.gauge_value(&host));

        let decision = self.retry_policy.decide(class, record.attempts, record.max_attempts);
        let last_error = if detail == "circuit_open" { "circuit_open".to_string() } else { class.as_error_label().to_string() };

        match decision {
            RetryDecision::CompleteSuccess => {
                self.lifecycle
                    .transition(webhook_id, |r| {
                        r.status = WebhookStatus::Delivered;
                        r.response_code = status_code;
                    })
                    .await?;
                let labels = [("status", "delivered"), ("host", host.as_str())];
                metrics::counter!("webhook_delivery_total", &labels).increment(1);
                info!(webhook_id, host, "webhook delivered");
            }
            RetryDecision::ScheduleRetry(delay) => {
                self.lifecycle
                    .transition(webhook_id, |r| {
                        r.status = WebhookStatus::Retrying;
                        r.response_code = status_code;
                        r.last_error = Some(last_error.clone());
                    })
                    .await?;
                let eta = chrono::Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                self.queue
                    .enqueue(
                        &self.queue_name,
                        TaskEnvelope::Deliver(DeliverTaskPayload {
                            webhook_id: webhook_id.to_string(),
                            webhook_url: record.webhook_url.clone(),
                            payload: record.payload.clone().unwrap_or(serde_json::Value::Null),
                            correlation_id: record.correlation_id.clone(),
                        }),
                        record.attempts,
                        Some(eta),
                    )
                    .await?;
                let labels = [("status", "retrying"), ("host", host.as_str())];
                metrics::counter!("webhook_delivery_total", &labels).increment(1);
                info!(webhook_id, host, delay_secs = delay.as_secs(), "webhook delivery scheduled for retry");
            }
            RetryDecision::FailPermanent => {
                self.fail_permanent(webhook_id, status_code, class, &detail).await?;
            }
        }

        Ok(())
    }

    async fn fail_permanent(
        &self,
        webhook_id: &str,
        status_code: Option<u16>,
        class: OutcomeClass,
        detail: &str,
    ) -> Result<(), DeliveryTaskError> {
        let record = self
            .lifecycle
            .transition(webhook_id, |r| {
                r.status = WebhookStatus::Failed;
                r.response_code = status_code;
                r.last_error = Some(class.as_error_label().to_string());
            })
            .await?;

        self.lifecycle
            .write_dead_letter(DeadLetterEntry {
                webhook_id: webhook_id.to_string(),
                webhook_url: record.webhook_url.clone(),
                payload: record.payload.clone(),
                error_class: class.as_error_label().to_string(),
                error_detail: detail.to_string(),
                attempts: record.attempts,
                correlation_id: record.correlation_id.clone(),
                created_at: chrono::Utc::now(),
            })
            .await?;

        let host = record
            .webhook_url
            .parse::<url::Url>()
            .map(|u| Self::destination_host(&u))
            .unwrap_or_else(|_| "unknown".to_string());
        let labels = [("status", "failed"), ("host", host.as_str())];
        metrics::counter!("webhook_delivery_total", &labels).increment(1);
        warn!(webhook_id, error_class = class.as_error_label(), "webhook delivery failed permanently");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::delivery::DeliveryClientConfig;
    use crate::queue::MemoryTaskQueue;
    use crate::store::MemoryStore;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(server_uri: &str) -> (WebhookDeliveryTask, Arc<LifecycleManager>) {
        let lifecycle = Arc::new(LifecycleManager::new(Arc::new(MemoryStore::new())));
        let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let client = Arc::new(
            DeliveryClient::new(DeliveryClientConfig {
                allow_private_destinations: true,
                ..Default::default()
            })
            .unwrap(),
        );
        let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::new());
        let retry_policy =
            RetryPolicy::new(std::time::Duration::from_millis(1), std::time::Duration::from_millis(5));
        let task = WebhookDeliveryTask::new(
            lifecycle.clone(),
            breaker,
            client,
            retry_policy,
            queue,
            "webhook_queue",
            true,
            None,
        );
        let _ = server_uri;
        (task, lifecycle)
    }

    #[tokio::test]
    async fn happy_path_delivers_and_marks_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let (task, lifecycle) = task(&server.uri());
        let record = crate::model::WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            format!("{}/hook", server.uri()),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        let webhook_id = record.webhook_id();
        lifecycle.create(record).await.unwrap();

        task.execute(&webhook_id).await.unwrap();

        let updated = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookStatus::Delivered);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.response_code, Some(200));
        assert!(updated.completed_at.is_some());
    }

    #[tokio::test]
    async fn client_4xx_permanent_fails_without_retry_and_writes_dead_letter() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(404)).mount(&server).await;

        let (task, lifecycle) = task(&server.uri());
        let record = crate::model::WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            format!("{}/hook", server.uri()),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        let webhook_id = record.webhook_id();
        lifecycle.create(record).await.unwrap();

        task.execute(&webhook_id).await.unwrap();

        let updated = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookStatus::Failed);
        assert_eq!(updated.attempts, 1);

        let dead_letter = lifecycle
            .get(&webhook_id)
            .await
            .unwrap()
            .map(|_| ())
            .and(Some(()));
        assert!(dead_letter.is_some());
    }

    #[tokio::test]
    async fn terminal_record_is_a_no_op() {
        let server = MockServer::start().await;
        let (task, lifecycle) = task(&server.uri());
        let mut record = crate::model::WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            "https://example.com/hook".to_string(),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        record.status = WebhookStatus::Delivered;
        record.attempts = 1;
        let webhook_id = record.webhook_id();
        lifecycle.create(record).await.unwrap();

        task.execute(&webhook_id).await.unwrap();

        let unchanged = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(unchanged.attempts, 1);
    }

    #[tokio::test]
    async fn server_error_retries_twice_then_succeeds() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use wiremock::{Request, Respond};

        struct FlakyThenOk(AtomicUsize);
        impl Respond for FlakyThenOk {
            fn respond(&self, _request: &Request) -> ResponseTemplate {
                let call = self.0.fetch_add(1, Ordering::SeqCst);
                if call < 2 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(200)
                }
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(FlakyThenOk(AtomicUsize::new(0)))
            .mount(&server)
            .await;

        let (task, lifecycle) = task(&server.uri());
        let record = crate::model::WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            format!("{}/hook", server.uri()),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        let webhook_id = record.webhook_id();
        lifecycle.create(record).await.unwrap();

        task.execute(&webhook_id).await.unwrap();
        let after_first = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(after_first.status, WebhookStatus::Retrying);
        assert_eq!(after_first.attempts, 1);

        task.execute(&webhook_id).await.unwrap();
        let after_second = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(after_second.status, WebhookStatus::Retrying);
        assert_eq!(after_second.attempts, 2);

        task.execute(&webhook_id).await.unwrap();
        let after_third = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(after_third.status, WebhookStatus::Delivered);
        assert_eq!(after_third.attempts, 3);
        assert_eq!(after_third.response_code, Some(200));
    }

    #[tokio::test]
    async fn timeout_exhausts_attempts_and_writes_dead_letter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(200)))
            .mount(&server)
            .await;

        let lifecycle = Arc::new(LifecycleManager::new(Arc::new(MemoryStore::new())));
        let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let client = Arc::new(
            DeliveryClient::new(DeliveryClientConfig {
                allow_private_destinations: true,
                timeout: std::time::Duration::from_millis(20),
                ..Default::default()
            })
            .unwrap(),
        );
        let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::new());
        let retry_policy =
            RetryPolicy::new(std::time::Duration::from_millis(1), std::time::Duration::from_millis(5));
        let task = WebhookDeliveryTask::new(
            lifecycle.clone(),
            breaker,
            client,
            retry_policy,
            queue,
            "webhook_queue",
            true,
            None,
        );

        let record = crate::model::WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            format!("{}/hook", server.uri()),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        let webhook_id = record.webhook_id();
        lifecycle.create(record).await.unwrap();

        task.execute(&webhook_id).await.unwrap();
        task.execute(&webhook_id).await.unwrap();
        task.execute(&webhook_id).await.unwrap();

        let updated = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookStatus::Failed);
        assert_eq!(updated.attempts, 3);
        assert_eq!(updated.last_error, Some("timeout".to_string()));
    }

    #[tokio::test]
    async fn invalid_url_fails_immediately_without_http_attempt() {
        let server = MockServer::start().await;
        let (task, lifecycle) = task(&server.uri());
        let record = crate::model::WebhookRecord::new(
            "REF1".to_string(),
            "task-1".to_string(),
            "ftp://x".to_string(),
            3,
            "corr-1".to_string(),
            json!({"ok": true}),
        );
        let webhook_id = record.webhook_id();
        lifecycle.create(record).await.unwrap();

        task.execute(&webhook_id).await.unwrap();

        let updated = lifecycle.get(&webhook_id).await.unwrap().unwrap();
        assert_eq!(updated.status, WebhookStatus::Failed);
        assert_eq!(updated.last_error, Some("invalid_url".to_string()));
    }
}
