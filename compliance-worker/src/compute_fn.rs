//! The compute function itself is out of scope for this core (it is the
//! caller's business logic); this module only supplies the pluggable
//! seam and a minimal reference implementation exercising it end to end.

use async_trait::async_trait;
use compliance_core::compute::{ComputeError, ComputeFunction};
use compliance_core::queue::ComputeTaskPayload;

/// Echoes the claim fields back with a generated result shape, standing
/// in for whatever claim-processing logic a deployment plugs in here.
pub struct EchoComputeFunction;

#[async_trait]
impl ComputeFunction for EchoComputeFunction {
    async fn execute(&self, payload: &ComputeTaskPayload) -> Result<serde_json::Value, ComputeError> {
        Ok(serde_json::json!({
            "reference_id": payload.reference_id,
            "task_id": payload.task_id,
            "processing_mode": payload.processing_mode,
            "claim_fields": payload.claim_fields,
            "status": "complete",
        }))
    }
}
