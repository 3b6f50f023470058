//! Per-destination circuit breaker (§4.6): short-circuits delivery
//! attempts to a host that has recently failed repeatedly, so a dead
//! receiver doesn't tie up workers retrying it on every attempt.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::retry::OutcomeClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
#[error("circuit open for host {host}, retry after {retry_after_secs}s")]
pub struct CircuitOpen {
    pub host: String,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Outcome classes that do not count as failures for breaker purposes
    /// (client errors are the caller's fault, not the destination's).
    pub excluded_error_classes: Vec<OutcomeClass>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            excluded_error_classes: vec![
                OutcomeClass::Client4xxPermanent,
                OutcomeClass::Client4xxRetriable,
                OutcomeClass::InvalidUrl,
            ],
        }
    }
}

impl CircuitBreakerConfig {
    fn counts_as_failure(&self, class: OutcomeClass) -> bool {
        !self.excluded_error_classes.contains(&class)
    }
}

#[derive(Debug, Clone)]
struct HostState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Registry of per-host circuit breaker state, shared across delivery
/// workers within a process.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    hosts: Arc<RwLock<HashMap<String, HostState>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            hosts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the current state for `host`, transitioning Open -> HalfOpen
    /// if `reset_timeout` has elapsed since it opened.
    pub fn current_state(&self, host: &str) -> CircuitState {
        let mut hosts = self.hosts.write().expect("poisoned breaker mutex");
        let entry = hosts.entry(host.to_string()).or_default();
        self.maybe_half_open(entry);
        entry.state
    }

    fn maybe_half_open(&self, entry: &mut HostState) {
        if entry.state == CircuitState::Open {
            if let Some(opened_at) = entry.opened_at {
                let elapsed = Utc::now() - opened_at;
                if elapsed
                    >= chrono::Duration::from_std(self.config.reset_timeout)
                        .unwrap_or(chrono::Duration::zero())
                {
                    entry.state = CircuitState::HalfOpen;
                }
            }
        }
    }

    /// Gate a delivery attempt: returns `Err` if the circuit for `host` is
    /// open, permitting at most one in-flight probe while half-open.
    pub fn check(&self, host: &str) -> Result<(), CircuitOpen> {
        let mut hosts = self.hosts.write().expect("poisoned breaker mutex");
        let entry = hosts.entry(host.to_string()).or_default();
        self.maybe_half_open(entry);
        match entry.state {
            CircuitState::Open => {
                let retry_after_secs = entry
                    .opened_at
                    .map(|opened_at| {
                        let elapsed = (Utc::now() - opened_at)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        self.config.reset_timeout.saturating_sub(elapsed).as_secs()
                    })
                    .unwrap_or(self.config.reset_timeout.as_secs());
                Err(CircuitOpen {
                    host: host.to_string(),
                    retry_after_secs,
                })
            }
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Record the outcome of an attempt that was allowed through `check`.
    pub fn record_outcome(&self, host: &str, class: OutcomeClass) {
        let mut hosts = self.hosts.write().expect("poisoned breaker mutex");
        let entry = hosts.entry(host.to_string()).or_default();

        if class == OutcomeClass::Success2xx {
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
            entry.opened_at = None;
            return;
        }

        if !self.config.counts_as_failure(class) {
            return;
        }

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Utc::now());
                entry.consecutive_failures += 1;
            }
            CircuitState::Closed | CircuitState::Open => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(Utc::now());
                }
            }
        }
    }

    /// Snapshot gauge value for metrics: 0=closed, 1=half-open, 2=open.
    pub fn gauge_value(&self, host: &str) -> f64 {
        match self.current_state(host) {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}
