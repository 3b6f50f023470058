use std::sync::Arc;
use std::time::Duration;

use compliance_core::compute::{ComputeFunction, TaskStatusStore};
use compliance_core::lifecycle::LifecycleManager;
use compliance_core::queue::TaskQueue;
use compliance_core::store::StatusStore;

pub const COMPUTE_QUEUE: &str = "compute_queue";

#[derive(Clone)]
pub struct AppState(pub Arc<AppStateInner>);

pub struct AppStateInner {
    pub store: Arc<dyn StatusStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub queue: Arc<dyn TaskQueue>,
    pub task_status: Arc<dyn TaskStatusStore>,
    pub compute_fn: Arc<dyn ComputeFunction>,
    pub compute_timeout: Duration,
    pub delivery_max_attempts: u32,
    pub allow_private_destinations: bool,
    pub webhook_allowlist: Option<regex::Regex>,
}

impl std::ops::Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
