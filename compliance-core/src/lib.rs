//! Reliable asynchronous webhook delivery and task dispatch core.
//!
//! This crate is the concurrency and delivery machinery shared by the
//! ingress API, the compute/delivery workers, and the janitor: the task
//! queue, the webhook delivery state machine, the circuit breaker, the
//! status store, and the dead-letter pipeline. It does not itself decide
//! what a compute task computes, or how ingress authenticates callers.

pub mod breaker;
pub mod compute;
pub mod delivery;
pub mod delivery_task;
pub mod dns;
pub mod lifecycle;
pub mod metrics_support;
pub mod model;
pub mod queue;
pub mod retry;
pub mod store;
pub mod util;
