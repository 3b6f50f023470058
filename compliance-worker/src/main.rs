use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use compliance_core::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use compliance_core::compute::{ComputeTaskRunner, RedisTaskStatusStore, TaskStatusStore};
use compliance_core::delivery::{DeliveryClient, DeliveryClientConfig};
use compliance_core::delivery_task::WebhookDeliveryTask;
use compliance_core::lifecycle::LifecycleManager;
use compliance_core::metrics_support::setup_metrics_routes;
use compliance_core::queue::{RedisTaskQueue, TaskQueue};
use compliance_core::retry::RetryPolicy;
use compliance_core::store::{RedisStore, StatusStore};
use compute_fn::EchoComputeFunction;
use compute_worker::ComputeWorker;
use config::Config;
use delivery_worker::DeliveryWorker;
use envconfig::Envconfig;
use health::HealthRegistry;

mod compute_fn;
mod compute_worker;
mod config;
mod delivery_worker;

const COMPUTE_QUEUE: &str = "compute_queue";
const DELIVERY_QUEUE: &str = "webhook_queue";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store: Arc<dyn StatusStore> = Arc::new(
        RedisStore::new(&config.store_host, config.status_db_index)
            .expect("failed to construct status store"),
    );
    let lifecycle = Arc::new(LifecycleManager::new(store));

    let queue: Arc<dyn TaskQueue> = Arc::new(
        RedisTaskQueue::new(&config.store_host, config.queue_db_index)
            .expect("failed to construct task queue"),
    );

    let task_status: Arc<dyn TaskStatusStore> = Arc::new(
        RedisTaskStatusStore::new(&config.store_host, config.queue_db_index)
            .expect("failed to construct task status store"),
    );

    let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: config.breaker_failure_threshold,
        reset_timeout: Duration::from_secs(config.breaker_reset_s),
        ..Default::default()
    }));

    let delivery_client = Arc::new(
        DeliveryClient::new(DeliveryClientConfig {
            timeout: Duration::from_secs(config.delivery_timeout_s),
            allow_private_destinations: config.allow_private_destinations,
            hmac_secret: config.webhook_hmac_secret.clone(),
        })
        .expect("failed to construct delivery client"),
    );

    let delivery_retry_policy = RetryPolicy::new(
        Duration::from_secs(config.delivery_retry_min_s),
        Duration::from_secs(config.delivery_retry_max_s),
    );
    let allowlist = config
        .webhook_allowlist
        .as_deref()
        .map(|pattern| regex::Regex::new(pattern).expect("WEBHOOK_ALLOWLIST must be a valid regex"));

    let delivery_task = Arc::new(WebhookDeliveryTask::new(
        lifecycle.clone(),
        breaker,
        delivery_client,
        delivery_retry_policy,
        queue.clone(),
        DELIVERY_QUEUE,
        config.allow_private_destinations,
        allowlist,
    ));

    let compute_retry_policy = RetryPolicy::new(
        Duration::from_secs(config.compute_retry_min_s),
        Duration::from_secs(config.compute_retry_max_s),
    );
    let compute_runner = Arc::new(
        ComputeTaskRunner::new(
            Arc::new(EchoComputeFunction),
            task_status,
            lifecycle,
            queue.clone(),
            COMPUTE_QUEUE,
            DELIVERY_QUEUE,
            compute_retry_policy,
            config.compute_max_attempts,
        )
        .with_timeout(Duration::from_secs(config.compute_timeout_s)),
    );

    let liveness = HealthRegistry::new("liveness");
    let compute_liveness = liveness.register("compute_worker".to_string(), Duration::from_secs(30)).await;
    let delivery_liveness = liveness.register("delivery_worker".to_string(), Duration::from_secs(30)).await;

    let compute_worker = ComputeWorker::new(
        queue.clone(),
        COMPUTE_QUEUE,
        compute_runner,
        config.compute_concurrency,
        compute_liveness,
    );
    let delivery_worker = DeliveryWorker::new(
        queue,
        DELIVERY_QUEUE,
        delivery_task,
        config.delivery_concurrency,
        delivery_liveness,
    );

    let app = setup_metrics_routes(
        Router::new().route("/health", get(move || std::future::ready(liveness.get_status()))),
    );
    let bind = config.bind();

    tokio::select! {
        result = async {
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            axum::serve(listener, app).await
        } => {
            if let Err(err) = result {
                tracing::error!("compliance-worker http server exited: {}", err);
            }
        }
        _ = compute_worker.run() => {
            tracing::error!("compute worker loop exited unexpectedly");
        }
        _ = delivery_worker.run() => {
            tracing::error!("delivery worker loop exited unexpectedly");
        }
    }
}
