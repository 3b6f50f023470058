//! `GET/DELETE` status and cleanup endpoints (§6): task status lookup,
//! webhook status lookup/listing/deletion, and operator-driven cleanup.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use compliance_core::model::WebhookStatus;
use compliance_core::store::ScanFilter;
use serde_json::{json, Value};

use crate::handlers::claims::ErrorBody;
use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorBody>);

fn not_found(what: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: format!("{what} not found") }))
}

fn internal_error(message: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %message, "internal error serving status request");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error: "internal error".to_string() }))
}

pub async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.task_status.get(&task_id).await.map_err(internal_error)?;
    match record {
        Some(record) => Ok(Json(json!({
            "task_id": record.task_id,
            "status": record.status,
            "reference_id": record.reference_id,
            "result": record.result,
            "error": record.error,
        }))),
        None => Err(not_found("task")),
    }
}

/// `WebhookRecord` minus `payload`, per the ingress contract.
fn strip_payload(mut record: serde_json::Value) -> serde_json::Value {
    if let Some(object) = record.as_object_mut() {
        object.remove("payload");
    }
    record
}

pub async fn webhook_status(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state.lifecycle.get(&webhook_id).await.map_err(internal_error)?;
    match record {
        Some(record) => {
            let value = serde_json::to_value(record).map_err(internal_error)?;
            Ok(Json(strip_payload(value)))
        }
        None => Err(not_found("webhook status")),
    }
}

fn parse_status(raw: &str) -> Result<WebhookStatus, ApiError> {
    serde_json::from_value(json!(raw)).map_err(|_| {
        (StatusCode::BAD_REQUEST, Json(ErrorBody { error: format!("unknown status: {raw}") }))
    })
}

fn filter_from_query(params: &HashMap<String, String>) -> Result<ScanFilter, ApiError> {
    let status = params.get("status").map(|raw| parse_status(raw)).transpose()?;
    Ok(ScanFilter { reference_id_prefix: params.get("reference_id").cloned(), status })
}

pub async fn list_webhook_statuses(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let filter = filter_from_query(&params)?;
    let page: u32 = params.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    let page_size: u32 = params.get("page_size").and_then(|v| v.parse().ok()).unwrap_or(20);

    let scanned = state.lifecycle.list(filter, page, page_size).await.map_err(internal_error)?;
    let items: Result<Vec<Value>, _> = scanned.items.into_iter().map(serde_json::to_value).collect();
    let items = items.map_err(internal_error)?.into_iter().map(strip_payload).collect::<Vec<_>>();

    Ok(Json(json!({
        "items": items,
        "page": scanned.page,
        "page_size": scanned.page_size,
        "total": scanned.total,
    })))
}

pub async fn delete_webhook_status(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let existed = state.lifecycle.delete(&webhook_id).await.map_err(internal_error)?;
    if existed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("webhook status"))
    }
}

pub async fn delete_webhook_statuses(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let filter = filter_from_query(&params)?;
    let deleted = state.lifecycle.cleanup(filter, Duration::ZERO).await.map_err(internal_error)?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn webhook_cleanup(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let filter = filter_from_query(&params)?;
    let older_than_days: i64 = params.get("older_than_days").and_then(|v| v.parse().ok()).unwrap_or(7);
    let older_than = Duration::from_secs(older_than_days.max(0) as u64 * 24 * 60 * 60);

    let deleted = state.lifecycle.cleanup(filter, older_than).await.map_err(internal_error)?;
    Ok(Json(json!({ "deleted": deleted })))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "healthy" })),
        Err(err) => {
            tracing::warn!(error = %err, "status store failed health ping");
            Json(json!({ "status": "unhealthy", "error": err.to_string() }))
        }
    }
}
