use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compliance_core::lifecycle::LifecycleManager;
use compliance_core::store::ScanFilter;
use tracing::{error, info};

/// Single cleanup operation, run on a fixed interval by the janitor's main loop.
#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn cleanup(&self);
}

pub struct WebhookStatusCleaner {
    lifecycle: Arc<LifecycleManager>,
    max_age: Duration,
}

impl WebhookStatusCleaner {
    pub fn new(lifecycle: Arc<LifecycleManager>, max_age: Duration) -> Self {
        Self { lifecycle, max_age }
    }
}

#[async_trait]
impl Cleaner for WebhookStatusCleaner {
    async fn cleanup(&self) {
        match self.lifecycle.cleanup(ScanFilter::default(), self.max_age).await {
            Ok(deleted) => info!(deleted, "webhook status cleanup pass completed"),
            Err(err) => error!(error = %err, "webhook status cleanup pass failed"),
        }
    }
}
