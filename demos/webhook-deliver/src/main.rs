//! Example job type `"webhook.deliver"`: signs and POSTs an event payload
//! to a subscriber-owned URL.
//!
//! Unlike a plain outbound-request connector, a failed delivery here is
//! reported as a retryable `HandlerError` rather than folded into an
//! always-`Ok` result carrying a `delivered: false` flag. That lets the
//! executor's own retry/backoff machinery drive re-delivery instead of
//! requiring a second retry system layered on top of it.

use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use hmac::{Hmac, Mac};
use jobforge_core::{HandlerError, HandlerRegistry, JobContext, JobHandler};
use jobforge_worker::cli::Cli;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

const MAX_RESPONSE_PREVIEW: usize = 500;

#[derive(Debug, Deserialize)]
struct WebhookDeliverPayload {
    target_url: String,
    event_type: String,
    event_id: String,
    data: serde_json::Value,
    #[serde(default)]
    secret_ref: Option<String>,
    #[serde(default = "default_algo")]
    signature_algo: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_algo() -> String {
    "sha256".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Serialize)]
struct WebhookDeliverResult {
    delivered: bool,
    status: u16,
    duration_ms: u64,
    response_preview: String,
    signature: Option<String>,
    timestamp: String,
}

fn sign(body: &str, secret: &str, algo: &str) -> Result<String, HandlerError> {
    match algo {
        "sha256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|e| HandlerError::terminal(format!("invalid signing key: {e}")))?;
            mac.update(body.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
        "sha512" => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
                .map_err(|e| HandlerError::terminal(format!("invalid signing key: {e}")))?;
            mac.update(body.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
        other => Err(HandlerError::terminal(format!(
            "signature_algo must be sha256 or sha512, got {other}"
        ))),
    }
}

struct WebhookDeliverHandler {
    client: reqwest::Client,
}

#[async_trait]
impl JobHandler for WebhookDeliverHandler {
    async fn handle(
        &self,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let payload: WebhookDeliverPayload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::terminal(format!("invalid payload: {e}")))?;

        if payload.signature_algo != "sha256" && payload.signature_algo != "sha512" {
            return Err(HandlerError::terminal(format!(
                "signature_algo must be sha256 or sha512, got {}",
                payload.signature_algo
            )));
        }

        let timestamp = chrono::Utc::now().to_rfc3339();
        let body = serde_json::json!({
            "event_type": payload.event_type,
            "event_id": payload.event_id,
            "timestamp": timestamp,
            "data": payload.data,
        });
        let body_string =
            serde_json::to_string(&body).map_err(|e| HandlerError::terminal(e.to_string()))?;

        let mut request = self
            .client
            .post(&payload.target_url)
            .timeout(std::time::Duration::from_millis(payload.timeout_ms))
            .header("Content-Type", "application/json")
            .header("User-Agent", "JobForge-Webhook/1.0")
            .header("X-JobForge-Event", &payload.event_type)
            .header("X-JobForge-Event-ID", &payload.event_id)
            .header("X-JobForge-Timestamp", &timestamp)
            .header("X-JobForge-Delivery-Attempt", ctx.attempt_no.to_string());

        let mut signature = None;
        if let Some(secret_ref) = &payload.secret_ref {
            let secret = std::env::var(secret_ref).map_err(|_| {
                HandlerError::terminal(format!("secret not found: {secret_ref}"))
            })?;
            let sig = sign(&body_string, &secret, &payload.signature_algo)?;
            request = request.header(
                "X-JobForge-Signature",
                format!("{}={}", payload.signature_algo, sig),
            );
            signature = Some(sig);
        }

        let start = Instant::now();
        let response = request
            .body(body_string)
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("delivery request failed: {e}")))?;
        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| HandlerError::retryable(format!("failed to read response body: {e}")))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response_preview = if response_text.len() > MAX_RESPONSE_PREVIEW {
            format!("{}... (truncated)", &response_text[..MAX_RESPONSE_PREVIEW])
        } else {
            response_text
        };

        let result = WebhookDeliverResult {
            delivered: status.is_success(),
            status: status.as_u16(),
            duration_ms,
            response_preview,
            signature,
            timestamp,
        };

        if !status.is_success() {
            return Err(HandlerError::retryable(format!(
                "subscriber returned {}",
                status.as_u16()
            ))
            .with_detail(serde_json::to_value(&result).unwrap_or(serde_json::Value::Null)));
        }

        serde_json::to_value(result).map_err(|e| HandlerError::terminal(e.to_string()))
    }
}

#[tokio::main]
async fn main() {
    jobforge_worker::logging::init();
    let cli = Cli::parse();
    let app = match jobforge_worker::config::load_from_env() {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(jobforge_worker::EXIT_CONFIG_ERROR);
        }
    };

    let registry = HandlerRegistry::builder()
        .register(
            "webhook.deliver",
            WebhookDeliverHandler {
                client: reqwest::Client::new(),
            },
            std::time::Duration::from_secs(15),
            5,
        )
        .expect("single registration cannot collide")
        .build();

    if let Err(err) = jobforge_worker::run(cli, app, registry).await {
        tracing::error!(error = %err, "worker exited unexpectedly");
        std::process::exit(jobforge_worker::EXIT_CRASH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_signature_is_deterministic_hex() {
        let sig = sign("hello", "secret", "sha256").unwrap();
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, sign("hello", "secret", "sha256").unwrap());
    }

    #[test]
    fn sha512_signature_differs_from_sha256() {
        let a = sign("hello", "secret", "sha256").unwrap();
        let b = sign("hello", "secret", "sha512").unwrap();
        assert_ne!(a, b);
        assert_eq!(b.len(), 128);
    }

    #[test]
    fn unknown_algo_is_rejected() {
        assert!(sign("hello", "secret", "md5").is_err());
    }
}
