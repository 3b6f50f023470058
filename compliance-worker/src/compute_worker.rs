//! Compute queue worker loop: strict FIFO at concurrency 1 by default
//! (§4.7), dequeue -> execute -> ack, with late acknowledgement so a
//! worker crash mid-task leaves the task visible to another worker.

use std::sync::Arc;
use std::time::Duration;

use compliance_core::compute::ComputeTaskRunner;
use compliance_core::queue::TaskEnvelope;
use health::HealthHandle;
use tokio::sync::Semaphore;
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct ComputeWorker {
    queue: Arc<dyn compliance_core::queue::TaskQueue>,
    queue_name: String,
    runner: Arc<ComputeTaskRunner>,
    max_concurrent: usize,
    liveness: HealthHandle,
}

impl ComputeWorker {
    pub fn new(
        queue: Arc<dyn compliance_core::queue::TaskQueue>,
        queue_name: impl Into<String>,
        runner: Arc<ComputeTaskRunner>,
        max_concurrent: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self { queue, queue_name: queue_name.into(), runner, max_concurrent, liveness }
    }

    pub async fn run(&self) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            let Some(permit) = semaphore.clone().try_acquire_owned().ok() else { continue };

            let delivery = match self.queue.dequeue(&self.queue_name).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "failed to dequeue compute task");
                    drop(permit);
                    continue;
                }
            };

            let TaskEnvelope::Compute(payload) = delivery.envelope else {
                warn!("non-compute envelope dequeued from compute queue, acking and dropping");
                let _ = self.queue.ack(&self.queue_name, &delivery.lease_id).await;
                drop(permit);
                continue;
            };

            let queue = self.queue.clone();
            let queue_name = self.queue_name.clone();
            let runner = self.runner.clone();
            let lease_id = delivery.lease_id.clone();
            let attempt_count = delivery.attempt_count;

            tokio::spawn(async move {
                let _permit = permit;
                match runner.execute(payload, attempt_count).await {
                    Ok(()) => {
                        if let Err(err) = queue.ack(&queue_name, &lease_id).await {
                            error!(error = %err, "failed to ack compute task");
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "compute task execution failed, nacking for redelivery");
                        let _ = queue.nack(&queue_name, &lease_id).await;
                    }
                }
            });
        }
    }
}
