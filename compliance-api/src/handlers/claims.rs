//! `POST /process-claim-{basic|extended|complete}` (§6): when a
//! `webhook_url` is supplied the claim is enqueued for asynchronous
//! processing and a `202` is returned immediately; otherwise the compute
//! function runs in the request and the full result comes back as `200`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use compliance_core::compute::{TaskState, TaskStatusRecord};
use compliance_core::delivery::validate_url;
use compliance_core::model::WebhookRecord;
use compliance_core::queue::{ComputeTaskPayload, TaskEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::state::{AppState, COMPUTE_QUEUE};

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub reference_id: String,
    pub employee_number: String,
    pub first_name: String,
    pub last_name: String,
    pub organization_name: Option<String>,
    pub crd_number: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message.into() }))
}

fn internal_error(message: impl std::fmt::Display) -> ApiError {
    error!(error = %message, "internal error handling claim");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: "internal error".to_string() }))
}

pub async fn process_claim(
    State(state): State<AppState>,
    Path(mode): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let processing_mode = match mode.as_str() {
        "basic" | "extended" | "complete" => mode,
        other => return Err(bad_request(format!("unknown processing mode: {other}"))),
    };

    if body.reference_id.trim().is_empty() {
        return Err(bad_request("reference_id is required"));
    }
    if body.employee_number.trim().is_empty() {
        return Err(bad_request("employee_number is required"));
    }
    if body.first_name.trim().is_empty() || body.last_name.trim().is_empty() {
        return Err(bad_request("first_name and last_name are required"));
    }

    if let Some(webhook_url) = &body.webhook_url {
        validate_url(webhook_url, state.allow_private_destinations, state.webhook_allowlist.as_ref())
            .map_err(|err| bad_request(err.to_string()))?;
    }

    let task_id = Uuid::new_v4().to_string();
    let correlation_id = Uuid::new_v4().to_string();
    let claim_fields = json!({
        "employee_number": body.employee_number,
        "first_name": body.first_name,
        "last_name": body.last_name,
        "organization_name": body.organization_name,
        "crd_number": body.crd_number,
    });

    let payload = ComputeTaskPayload {
        reference_id: body.reference_id.clone(),
        task_id: task_id.clone(),
        processing_mode,
        claim_fields,
        webhook_url: body.webhook_url.clone(),
        correlation_id,
    };

    if let Some(webhook_url) = body.webhook_url.clone() {
        let record = WebhookRecord::new(
            payload.reference_id.clone(),
            payload.task_id.clone(),
            webhook_url,
            state.delivery_max_attempts,
            payload.correlation_id.clone(),
            Value::Null,
        );
        state.lifecycle.create(record).await.map_err(internal_error)?;

        state
            .task_status
            .put(&TaskStatusRecord {
                task_id: task_id.clone(),
                reference_id: payload.reference_id.clone(),
                status: TaskState::Queued,
                result: None,
                error: None,
                updated_at: Utc::now(),
            })
            .await
            .map_err(internal_error)?;

        state
            .queue
            .enqueue(COMPUTE_QUEUE, TaskEnvelope::Compute(payload.clone()), 0, None)
            .await
            .map_err(internal_error)?;

        metrics::counter!("claim_api_requests_total", &[("mode", "async")]).increment(1);

        Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "processing_queued",
                "reference_id": payload.reference_id,
                "task_id": task_id,
            })),
        ))
    } else {
        metrics::counter!("claim_api_requests_total", &[("mode", "sync")]).increment(1);

        let outcome = tokio::time::timeout(state.compute_timeout, state.compute_fn.execute(&payload)).await;
        match outcome {
            Ok(Ok(result)) => Ok((StatusCode::OK, Json(result))),
            Ok(Err(err)) => {
                warn!(task_id = %task_id, error = %err, "synchronous compute failed");
                Err((StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorBody { error: err.to_string() })))
            }
            Err(_) => {
                warn!(task_id = %task_id, "synchronous compute timed out");
                Err((StatusCode::GATEWAY_TIMEOUT, Json(ErrorBody { error: "compute timed out".to_string() })))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use compliance_core::compute::ComputeError;
    use compliance_core::lifecycle::LifecycleManager;
    use compliance_core::queue::MemoryTaskQueue;
    use compliance_core::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::state::AppStateInner;

    struct EchoFn;

    #[async_trait]
    impl compliance_core::compute::ComputeFunction for EchoFn {
        async fn execute(&self, payload: &ComputeTaskPayload) -> Result<Value, ComputeError> {
            Ok(json!({ "reference_id": payload.reference_id, "status": "complete" }))
        }
    }

    struct FailingFn;

    #[async_trait]
    impl compliance_core::compute::ComputeFunction for FailingFn {
        async fn execute(&self, _payload: &ComputeTaskPayload) -> Result<Value, ComputeError> {
            Err(ComputeError::Permanent("bad claim fields".to_string()))
        }
    }

    fn state_with(compute_fn: Arc<dyn compliance_core::compute::ComputeFunction>) -> AppState {
        let store = Arc::new(MemoryStore::new());
        AppState(Arc::new(AppStateInner {
            store: store.clone(),
            lifecycle: Arc::new(LifecycleManager::new(store)),
            queue: Arc::new(MemoryTaskQueue::new()),
            task_status: Arc::new(compliance_core::compute::MemoryTaskStatusStore::new()),
            compute_fn,
            compute_timeout: Duration::from_secs(5),
            delivery_max_attempts: 3,
            allow_private_destinations: true,
            webhook_allowlist: None,
        }))
    }

    fn valid_body(webhook_url: Option<&str>) -> ClaimRequest {
        ClaimRequest {
            reference_id: "REF1".to_string(),
            employee_number: "E1".to_string(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            organization_name: None,
            crd_number: None,
            webhook_url: webhook_url.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn async_path_enqueues_and_returns_202() {
        let state = state_with(Arc::new(EchoFn));
        let (status, body) = process_claim(
            State(state),
            Path("basic".to_string()),
            Json(valid_body(Some("https://ok.example.com/hook"))),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.0["status"], "processing_queued");
        assert_eq!(body.0["reference_id"], "REF1");
    }

    #[tokio::test]
    async fn sync_path_returns_full_result() {
        let state = state_with(Arc::new(EchoFn));
        let (status, body) =
            process_claim(State(state), Path("complete".to_string()), Json(valid_body(None))).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["status"], "complete");
    }

    #[tokio::test]
    async fn sync_path_classifies_compute_failure_as_422() {
        let state = state_with(Arc::new(FailingFn));
        let err = process_claim(State(state), Path("basic".to_string()), Json(valid_body(None)))
            .await
            .unwrap_err();

        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let state = state_with(Arc::new(EchoFn));
        let err = process_claim(State(state), Path("bogus".to_string()), Json(valid_body(None)))
            .await
            .unwrap_err();

        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_webhook_url_is_rejected_eagerly() {
        let state = state_with(Arc::new(EchoFn));
        let err = process_claim(State(state), Path("basic".to_string()), Json(valid_body(Some("ftp://x"))))
            .await
            .unwrap_err();

        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_reference_id_is_rejected() {
        let state = state_with(Arc::new(EchoFn));
        let mut body = valid_body(None);
        body.reference_id = "  ".to_string();
        let err = process_claim(State(state), Path("basic".to_string()), Json(body)).await.unwrap_err();

        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
