use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use super::{claims, status};
use crate::state::AppState;

pub fn app(state: AppState, max_body_size: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route("/health", get(status::health))
        .route(
            "/process-claim-:mode",
            post(claims::process_claim).layer(RequestBodyLimitLayer::new(max_body_size)),
        )
        .route("/task-status/:task_id", get(status::task_status))
        .route(
            "/webhook-status/:webhook_id",
            get(status::webhook_status).delete(status::delete_webhook_status),
        )
        .route(
            "/webhook-statuses",
            get(status::list_webhook_statuses).delete(status::delete_webhook_statuses),
        )
        .route("/webhook-cleanup", post(status::webhook_cleanup))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "compliance-api"
}
