use std::sync::Arc;
use std::time::Duration;

use compliance_core::compute::{RedisTaskStatusStore, TaskStatusStore};
use compliance_core::lifecycle::LifecycleManager;
use compliance_core::metrics_support::setup_metrics_routes;
use compliance_core::queue::{RedisTaskQueue, TaskQueue};
use compliance_core::store::{RedisStore, StatusStore};
use compute_fn::EchoComputeFunction;
use config::Config;
use envconfig::Envconfig;
use state::{AppState, AppStateInner};

mod compute_fn;
mod config;
mod handlers;
mod state;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store: Arc<dyn StatusStore> = Arc::new(
        RedisStore::new(&config.store_host, config.status_db_index)
            .expect("failed to construct status store"),
    );
    let lifecycle = Arc::new(LifecycleManager::new(store.clone()));

    let queue: Arc<dyn TaskQueue> = Arc::new(
        RedisTaskQueue::new(&config.store_host, config.queue_db_index)
            .expect("failed to construct task queue"),
    );

    let task_status: Arc<dyn TaskStatusStore> = Arc::new(
        RedisTaskStatusStore::new(&config.store_host, config.queue_db_index)
            .expect("failed to construct task status store"),
    );

    let webhook_allowlist = config
        .webhook_allowlist
        .as_deref()
        .map(|pattern| regex::Regex::new(pattern).expect("WEBHOOK_ALLOWLIST must be a valid regex"));

    let state = AppState(Arc::new(AppStateInner {
        store,
        lifecycle,
        queue,
        task_status,
        compute_fn: Arc::new(EchoComputeFunction),
        compute_timeout: Duration::from_secs(config.compute_timeout_s),
        delivery_max_attempts: config.delivery_max_attempts,
        allow_private_destinations: config.allow_private_destinations,
        webhook_allowlist,
    }));

    let app = setup_metrics_routes(handlers::app(state, config.max_body_size));
    let bind = config.bind();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {bind}: {err}"));
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("compliance-api http server exited: {}", err);
    }
}
