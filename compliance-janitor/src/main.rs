use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use cleanup::{Cleaner, WebhookStatusCleaner};
use compliance_core::lifecycle::LifecycleManager;
use compliance_core::metrics_support::setup_metrics_routes;
use compliance_core::store::{RedisStore, StatusStore};
use config::Config;
use envconfig::Envconfig;
use futures::future::{select, Either};
use health::{HealthHandle, HealthRegistry};
use tokio::sync::Semaphore;

mod cleanup;
mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn cleanup_loop(cleaner: Box<dyn Cleaner>, interval_secs: u64, liveness: HealthHandle) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        liveness.report_healthy().await;
        cleaner.cleanup().await;
        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");

    let store: Arc<dyn StatusStore> = Arc::new(
        RedisStore::new(&config.store_host, config.status_db_index)
            .expect("failed to construct status store"),
    );
    let lifecycle = Arc::new(LifecycleManager::new(store));

    let cleaner: Box<dyn Cleaner> = Box::new(WebhookStatusCleaner::new(
        lifecycle,
        Duration::from_secs(config.cleanup_age_days as u64 * 24 * 60 * 60),
    ));

    let cleanup_liveness = liveness
        .register("cleanup_loop".to_string(), Duration::from_secs(config.cleanup_interval_secs * 2))
        .await;
    let cleanup_loop = Box::pin(cleanup_loop(cleaner, config.cleanup_interval_secs, cleanup_liveness));

    let app = setup_metrics_routes(handlers::app(liveness));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, cleanup_loop).await {
        Either::Left((listen_result, _)) => {
            if let Err(err) = listen_result {
                tracing::error!("failed to start compliance-janitor http server: {}", err);
            }
        }
        Either::Right((_, _)) => {
            tracing::error!("compliance-janitor cleanup task exited");
        }
    };
}
