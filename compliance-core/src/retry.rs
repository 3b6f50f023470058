//! Retry Policy Engine (§4.4): a pure function from `(outcome class,
//! attempts, max_attempts)` to a retry decision, kept free of I/O so it
//! can be exhaustively unit tested against the full Cartesian product.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Classification of a delivery attempt's outcome, per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success2xx,
    Client4xxPermanent,
    Client4xxRetriable,
    Server5xx,
    Timeout,
    ConnectionError,
    InvalidUrl,
}

impl OutcomeClass {
    pub fn as_error_label(self) -> &'static str {
        match self {
            OutcomeClass::Success2xx => "success_2xx",
            OutcomeClass::Client4xxPermanent => "client_4xx_permanent",
            OutcomeClass::Client4xxRetriable => "client_4xx_retriable",
            OutcomeClass::Server5xx => "server_5xx",
            OutcomeClass::Timeout => "timeout",
            OutcomeClass::ConnectionError => "connection_error",
            OutcomeClass::InvalidUrl => "invalid_url",
        }
    }

    /// Classify an observed HTTP status code into an outcome class.
    pub fn from_status(status: u16) -> OutcomeClass {
        match status {
            200..=299 => OutcomeClass::Success2xx,
            400 | 401 | 403 | 404 | 410 | 413 | 415 | 422 => OutcomeClass::Client4xxPermanent,
            408 | 425 | 429 => OutcomeClass::Client4xxRetriable,
            500..=599 => OutcomeClass::Server5xx,
            _ => OutcomeClass::Client4xxPermanent,
        }
    }
}

/// The decision produced by the retry policy for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    CompleteSuccess,
    ScheduleRetry(Duration),
    FailPermanent,
}

/// Pure retry/backoff policy, parameterized so it can be reused (with
/// different tunables) for both webhook delivery and compute retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_min: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_min: Duration::from_secs(30),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_min: Duration, cap: Duration) -> Self {
        Self { base_min, cap }
    }

    /// `base = min(cap, base_min * 2^attempts)`, computed before attempts is incremented
    /// for the retry being scheduled.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let candidate = self.base_min.saturating_mul(factor.min(u32::MAX as u64) as u32);
        candidate.min(self.cap)
    }

    /// Jittered delay, uniform in `[0.5 * base, 1.5 * base]`.
    pub fn jittered_delay(&self, attempts: u32) -> Duration {
        let base = self.base_delay(attempts);
        let mut rng = rand::thread_rng();
        let factor: f64 = rng.gen_range(0.5..=1.5);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Decide what to do after an attempt classified as `class`, given the
    /// attempt count *after* this attempt was made (it was incremented
    /// before the HTTP call, per §4.5 step 2) and the configured
    /// `max_attempts`. The backoff exponent uses the pre-increment attempt
    /// count (`attempts - 1`), so the delay scheduled after the first
    /// attempt is `base_delay(0)`, after the second is `base_delay(1)`, etc.
    pub fn decide(&self, class: OutcomeClass, attempts: u32, max_attempts: u32) -> RetryDecision {
        match class {
            OutcomeClass::Success2xx => RetryDecision::CompleteSuccess,
            OutcomeClass::InvalidUrl | OutcomeClass::Client4xxPermanent => {
                RetryDecision::FailPermanent
            }
            OutcomeClass::Client4xxRetriable
            | OutcomeClass::Server5xx
            | OutcomeClass::Timeout
            | OutcomeClass::ConnectionError => {
                if attempts >= max_attempts {
                    RetryDecision::FailPermanent
                } else {
                    RetryDecision::ScheduleRetry(self.jittered_delay(attempts.saturating_sub(1)))
                }
            }
        }
    }
}
