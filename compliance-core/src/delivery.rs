//! HTTP Delivery Client (§4.3): a single outbound POST per attempt, with
//! HMAC request signing, DNS safety, and classification of the result
//! into an `OutcomeClass` the Retry Policy Engine can consume.

use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use thiserror::Error;

use crate::dns::SafeResolver;
use crate::retry::OutcomeClass;
use crate::util::first_n_bytes_of_response;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook url failed validation: {0}")]
    InvalidUrl(String),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// The outcome of one delivery attempt, carrying enough detail for the
/// caller to write a useful `last_error` and dead-letter entry.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub class: OutcomeClass,
    pub status_code: Option<u16>,
    pub detail: String,
}

pub struct DeliveryClientConfig {
    pub timeout: Duration,
    pub allow_private_destinations: bool,
    pub hmac_secret: Option<String>,
}

impl Default for DeliveryClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            allow_private_destinations: false,
            hmac_secret: None,
        }
    }
}

/// Synchronous-per-attempt HTTP POST client used by the delivery task.
pub struct DeliveryClient {
    client: Client,
    hmac_secret: Option<String>,
}

impl DeliveryClient {
    pub fn new(config: DeliveryClientConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .dns_resolver(std::sync::Arc::new(SafeResolver::new(
                config.allow_private_destinations,
            )))
            .build()
            .map_err(|err| DeliveryError::RequestBuild(err.to_string()))?;

        Ok(Self { client, hmac_secret: config.hmac_secret })
    }

    fn signature(&self, body: &[u8]) -> Option<String> {
        let secret = self.hmac_secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// POST `body` to `webhook_url`, returning a classified outcome. Never
    /// returns an `Err` for HTTP-family failures — those are folded into
    /// `DeliveryOutcome` so the caller always has something to feed the
    /// Retry Policy Engine.
    pub async fn deliver(
        &self,
        webhook_url: &str,
        webhook_id: &str,
        correlation_id: &str,
        attempt: u32,
        body: &[u8],
    ) -> DeliveryOutcome {
        let mut request = self
            .client
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .header("X-Correlation-Id", correlation_id)
            .header("X-Webhook-Id", webhook_id)
            .header("X-Attempt", attempt.to_string())
            .body(body.to_vec());

        if let Some(signature) = self.signature(body) {
            request = request.header("X-Signature", signature);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let class = OutcomeClass::from_status(status);
                let detail = if class == OutcomeClass::Success2xx {
                    format!("http {status}")
                } else {
                    let body = first_n_bytes_of_response(response, 256).await;
                    format!("http {status}: {body}")
                };
                DeliveryOutcome { class, status_code: Some(status), detail }
            }
            Err(err) => {
                let class = if err.is_timeout() {
                    OutcomeClass::Timeout
                } else if err.is_connect() || err.is_request() {
                    OutcomeClass::ConnectionError
                } else {
                    OutcomeClass::ConnectionError
                };
                DeliveryOutcome { class, status_code: None, detail: err.to_string() }
            }
        }
    }
}

/// URL validation per §6: absolute http(s) URL with a non-empty host,
/// loopback rejected unless `allow_private_destinations`, and an optional
/// allow-list regex.
pub fn validate_url(
    candidate: &str,
    allow_private_destinations: bool,
    allowlist: Option<&regex::Regex>,
) -> Result<url::Url, DeliveryError> {
    let parsed =
        url::Url::parse(candidate).map_err(|err| DeliveryError::InvalidUrl(err.to_string()))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DeliveryError::InvalidUrl(format!(
            "unsupported scheme: {}",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| DeliveryError::InvalidUrl("missing host".to_string()))?;
    if host.is_empty() {
        return Err(DeliveryError::InvalidUrl("empty host".to_string()));
    }

    if !allow_private_destinations && is_loopback_host(host) {
        return Err(DeliveryError::InvalidUrl(format!("loopback host rejected: {host}")));
    }

    if let Some(pattern) = allowlist {
        if !pattern.is_match(host) {
            return Err(DeliveryError::InvalidUrl(format!("host not in allowlist: {host}")));
        }
    }

    Ok(parsed)
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}
