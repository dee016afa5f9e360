//! Example job type `"http.request"`: makes an outbound HTTP request on
//! the caller's behalf and returns a preview of the response.
//!
//! Payload/result shapes and the SSRF allowlist/blocklist follow the
//! reference `http_request` connector this deployment replaces; the
//! implementation itself is ordinary `reqwest`, not a port of that code.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use jobforge_core::{HandlerError, HandlerRegistry, JobContext, JobHandler};
use jobforge_worker::cli::Cli;
use serde::{Deserialize, Serialize};

const BLOCKED_HOSTS: &[&str] = &["localhost", "0.0.0.0", "169.254.169.254", "metadata.google.internal"];
const MAX_BODY_PREVIEW: usize = 1_000_000;

#[derive(Debug, Deserialize)]
struct HttpRequestPayload {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    allowlist: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Serialize)]
struct HttpRequestResult {
    status: u16,
    duration_ms: u64,
    response_body_preview: String,
    success: bool,
}

fn validate_url(url: &str, allowlist: &[String]) -> Result<(), String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid url: {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| "url has no host".to_string())?;

    if BLOCKED_HOSTS.contains(&host) {
        return Err(format!("blocked host: {host}"));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private(ip) {
            return Err(format!("private ip address not allowed: {host}"));
        }
    }
    if !allowlist.is_empty() && !allowlist.iter().any(|pattern| host_matches(host, pattern)) {
        return Err(format!("host not in allowlist: {host}"));
    }
    Ok(())
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        host.ends_with(suffix)
    } else {
        host == pattern || host.ends_with(&format!(".{pattern}"))
    }
}

struct HttpRequestHandler {
    client: reqwest::Client,
}

#[async_trait]
impl JobHandler for HttpRequestHandler {
    async fn handle(
        &self,
        payload: serde_json::Value,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let payload: HttpRequestPayload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::terminal(format!("invalid payload: {e}")))?;

        validate_url(&payload.url, &payload.allowlist)
            .map_err(HandlerError::terminal)?;

        let method: reqwest::Method = payload
            .method
            .parse()
            .map_err(|_| HandlerError::terminal(format!("unsupported method: {}", payload.method)))?;

        let mut request = self
            .client
            .request(method.clone(), &payload.url)
            .timeout(Duration::from_millis(payload.timeout_ms));
        for (key, value) in &payload.headers {
            request = request.header(key, value);
        }
        if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
            if let Some(body) = &payload.body {
                request = request.json(body);
            }
        }

        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("request failed: {e}")))?;
        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| HandlerError::retryable(format!("failed to read response body: {e}")))?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let response_body_preview = if body_text.len() > MAX_BODY_PREVIEW {
            format!("{}... (truncated)", &body_text[..MAX_BODY_PREVIEW])
        } else {
            body_text
        };

        let result = HttpRequestResult {
            status: status.as_u16(),
            duration_ms,
            response_body_preview,
            success: status.is_success(),
        };
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
            "http.request",
            HttpRequestHandler {
                client: reqwest::Client::new(),
            },
            Duration::from_secs(35),
            3,
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
    fn rejects_loopback_and_metadata_hosts() {
        assert!(validate_url("http://127.0.0.1/", &[]).is_err());
        assert!(validate_url("http://169.254.169.254/latest", &[]).is_err());
    }

    #[test]
    fn allows_public_host_with_empty_allowlist() {
        assert!(validate_url("https://example.com/resource", &[]).is_ok());
    }

    #[test]
    fn enforces_allowlist_when_present() {
        assert!(validate_url("https://example.com", &["api.example.com".to_string()]).is_err());
        assert!(validate_url("https://api.example.com", &["api.example.com".to_string()]).is_ok());
        assert!(validate_url("https://foo.example.com", &["*.example.com".to_string()]).is_ok());
    }
}
