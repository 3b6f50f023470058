//! Delivery queue worker loop: up to `DELIVERY_CONCURRENCY` concurrent
//! deliveries (§4.7/§5), same dequeue -> execute -> ack discipline as the
//! compute worker but with bounded parallelism.

use std::sync::Arc;
use std::time::Duration;

use compliance_core::delivery_task::WebhookDeliveryTask;
use compliance_core::queue::TaskEnvelope;
use health::HealthHandle;
use tokio::sync::Semaphore;
use tracing::{error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct DeliveryWorker {
    queue: Arc<dyn compliance_core::queue::TaskQueue>,
    queue_name: String,
    task: Arc<WebhookDeliveryTask>,
    max_concurrent: usize,
    liveness: HealthHandle,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<dyn compliance_core::queue::TaskQueue>,
        queue_name: impl Into<String>,
        task: Arc<WebhookDeliveryTask>,
        max_concurrent: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self { queue, queue_name: queue_name.into(), task, max_concurrent, liveness }
    }

    pub async fn run(&self) {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut interval = tokio::time::interval(POLL_INTERVAL);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;
            metrics::gauge!("delivery_worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / self.max_concurrent as f64);

            let Some(permit) = semaphore.clone().try_acquire_owned().ok() else { continue };

            let delivery = match self.queue.dequeue(&self.queue_name).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    continue;
                }
                Err(err) => {
                    error!(error = %err, "failed to dequeue delivery task");
                    drop(permit);
                    continue;
                }
            };

            let TaskEnvelope::Deliver(payload) = delivery.envelope else {
                warn!("non-deliver envelope dequeued from delivery queue, acking and dropping");
                let _ = self.queue.ack(&self.queue_name, &delivery.lease_id).await;
                drop(permit);
                continue;
            };

            let queue = self.queue.clone();
            let queue_name = self.queue_name.clone();
            let task = self.task.clone();
            let lease_id = delivery.lease_id.clone();

            tokio::spawn(async move {
                let _permit = permit;
                match task.execute(&payload.webhook_id).await {
                    Ok(()) => {
                        if let Err(err) = queue.ack(&queue_name, &lease_id).await {
                            error!(error = %err, "failed to ack delivery task");
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "delivery task execution failed, nacking for redelivery");
                        let _ = queue.nack(&queue_name, &lease_id).await;
                    }
                }
            });
        }
    }
}
