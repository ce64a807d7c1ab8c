/// HTTP action executor
///
/// Runs a single outbound request with a timeout and, when the node's failure action
/// is `Retry`, repeats retryable failures with capped exponential backoff. Success is
/// any 2xx; transport errors, timeouts and 5xx are retryable; 4xx is terminal.

use crate::config::HttpConfig;
use crate::runtime::error::HttpError;
use crate::workflow::types::{FailureAction, HttpMethod, RetryConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outbound request description
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    /// Sent as JSON for POST/PUT/PATCH, as query parameters otherwise
    pub body: Value,
}

/// Successful response
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub status: u16,
    /// Parsed JSON, or the raw text when the body is not JSON
    pub body: Value,
    pub headers: HashMap<String, String>,
    pub latency_ms: u64,
    pub attempts: u32,
}

/// Shared HTTP client; cloning reuses the connection pool
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    max_response_bytes: usize,
}

impl HttpExecutor {
    pub fn new(config: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_response_bytes: config.max_response_bytes,
        })
    }

    /// Execute `request`, applying `retry` only when `failure_action` is `Retry`
    pub async fn execute(
        &self,
        request: &HttpRequest,
        timeout: Duration,
        retry: &RetryConfig,
        failure_action: FailureAction,
    ) -> Result<HttpResult, HttpError> {
        let max_attempts = match failure_action {
            FailureAction::Retry => retry.max_attempts.max(1),
            FailureAction::Continue | FailureAction::Stop => 1,
        };

        let mut attempt = 1;
        loop {
            match self.send_once(request, timeout).await {
                Ok(mut result) => {
                    result.attempts = attempt;
                    return Ok(result);
                }
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = retry.delay_after(attempt);
                    tracing::warn!(
                        "🔁 {} {} attempt {}/{} failed ({}), retrying in {:?}",
                        request.method,
                        request.url,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        "❌ {} {} failed after {} attempt(s): {}",
                        request.method,
                        request.url,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// One attempt, no retries
    pub async fn send_once(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResult, HttpError> {
        let started = Instant::now();
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url)
            .timeout(timeout);

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if request.method.has_body() {
            if !request.body.is_null() {
                builder = builder.json(&request.body);
            }
        } else if let Value::Object(fields) = &request.body {
            let query: Vec<(String, String)> = fields
                .iter()
                .map(|(key, value)| (key.clone(), query_value(value)))
                .collect();
            builder = builder.query(&query);
        }

        tracing::debug!("🌍 HTTP Request: {} {}", request.method, request.url);
        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport_error(e, timeout))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
            .collect();
        let bytes = self.read_capped(response, timeout).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let body = decode_body(&bytes);
        tracing::debug!("📡 Response status: {} in {}ms", status, latency_ms);

        if (200..300).contains(&status) {
            Ok(HttpResult {
                status,
                body,
                headers,
                latency_ms,
                attempts: 1,
            })
        } else {
            Err(HttpError::StatusError {
                code: status,
                body: body_text(&body),
            })
        }
    }

    /// Buffer the body up to `max_response_bytes`; anything past the cap is never read
    async fn read_capped(&self, mut response: reqwest::Response, timeout: Duration) -> Result<Vec<u8>, HttpError> {
        let mut buffer = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_transport_error(e, timeout))?
        {
            let room = self.max_response_bytes - buffer.len();
            if chunk.len() > room {
                buffer.extend_from_slice(&chunk[..room]);
                tracing::warn!("✂️ Response body truncated at {} bytes", self.max_response_bytes);
                break;
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

/// Parsed JSON, or the text itself when the body is not JSON
fn decode_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Render a response body for logs and history snippets
pub fn body_text(body: &Value) -> String {
    match body {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn classify_transport_error(e: reqwest::Error, timeout: Duration) -> HttpError {
    if e.is_timeout() {
        HttpError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if e.is_builder() {
        HttpError::InvalidRequest { message: e.to_string() }
    } else {
        HttpError::ConnectionFailed { message: e.to_string() }
    }
}
