//! Signed HTTP webhook transport.
//!
//! Each delivery is a POST of the entry's payload as compact JSON. The
//! `X-Webhook-Signature` header carries the lowercase hex HMAC-SHA256 of the
//! exact body bytes under the endpoint secret; receivers authenticate by
//! recomputing it and deduplicate on `X-Webhook-Delivery`.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, field, instrument, warn, Span};

use courier_core::defaults::{
    WEBHOOK_CONNECT_TIMEOUT_SECS, WEBHOOK_ERROR_BODY_CHARS, WEBHOOK_TIMEOUT_SECS,
};
use courier_core::{
    encode_body, logging, DeliveryResult, Error, OutboxEntry, Result, WebhookEndpoint,
    WebhookTransport,
};

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";

/// Compute the lowercase hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Transport timeouts.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub timeout: Duration,
    /// Characters of a non-2xx response body kept in the error.
    pub error_body_chars: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(WEBHOOK_CONNECT_TIMEOUT_SECS),
            timeout: Duration::from_secs(WEBHOOK_TIMEOUT_SECS),
            error_body_chars: WEBHOOK_ERROR_BODY_CHARS,
        }
    }
}

impl TransportConfig {
    /// Load timeouts from the environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `WEBHOOK_CONNECT_TIMEOUT_SECS` | 10 |
    /// | `WEBHOOK_TIMEOUT_SECS` | 30 |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: env_secs("WEBHOOK_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            timeout: env_secs("WEBHOOK_TIMEOUT_SECS").unwrap_or(defaults.timeout),
            error_body_chars: defaults.error_body_chars,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Webhook transport over a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpWebhookTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build webhook client: {}", e)))?;
        Ok(Self { client, config })
    }

    async fn post(&self, endpoint: &WebhookEndpoint, entry: &OutboxEntry) -> DeliveryResult {
        let body = match encode_body(&entry.payload) {
            Ok(body) => body,
            Err(e) => return DeliveryResult::failure(None, format!("EncodeError: {}", e)),
        };
        let signature = compute_signature(&endpoint.secret, &body);

        let response = self
            .client
            .post(&endpoint.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_EVENT, &entry.event_type)
            .header(HEADER_DELIVERY, entry.id.to_string())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return DeliveryResult::success(status.as_u16());
                }
                let text = response.text().await.unwrap_or_default();
                let snippet: String = text.chars().take(self.config.error_body_chars).collect();
                DeliveryResult::failure(
                    Some(status.as_u16()),
                    format!("HTTP {}: {}", status.as_u16(), snippet),
                )
            }
            Err(e) => {
                DeliveryResult::failure(None, format!("{}: {}", error_class(&e), error_text(&e)))
            }
        }
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    #[instrument(
        skip_all,
        fields(
            subsystem = "webhook",
            component = "transport",
            event_id = field::Empty,
            event_type = field::Empty,
            endpoint_url = field::Empty,
            status_code = field::Empty,
        )
    )]
    async fn deliver(&self, endpoint: &WebhookEndpoint, entry: &OutboxEntry) -> DeliveryResult {
        let span = Span::current();
        span.record(logging::EVENT_ID, field::display(entry.id));
        span.record(logging::EVENT_TYPE, entry.event_type.as_str());
        span.record(logging::ENDPOINT_URL, endpoint.url.as_str());

        let start = Instant::now();
        let result = self.post(endpoint, entry).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Some(code) = result.status_code {
            span.record(logging::STATUS_CODE, code);
        }
        if result.ok {
            debug!(duration_ms, "Webhook delivered");
        } else {
            warn!(duration_ms, error = %result.error, "Webhook delivery failed");
        }
        result
    }
}

/// Short class name of a request error.
fn error_class(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "Timeout"
    } else if e.is_connect() {
        "ConnectError"
    } else if e.is_redirect() {
        "RedirectError"
    } else if e.is_body() {
        "BodyError"
    } else if e.is_decode() {
        "DecodeError"
    } else {
        "RequestError"
    }
}

/// Error message including its innermost cause (`reqwest` hides it in `source`).
fn error_text(e: &reqwest::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text = format!("{}: {}", text, cause);
        source = cause.source();
    }
    text
}
