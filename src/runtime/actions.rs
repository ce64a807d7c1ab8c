/// App actions: email relay, LLM completion and log shipping
///
/// All three go through the shared [`HttpExecutor`], so they inherit its timeout,
/// retry and classification rules. Text fields accept `{{ $.path }}` placeholders
/// resolved against the event with jsonpath.

use crate::config::{EmailConfig, LlmConfig};
use crate::runtime::error::HttpError;
use crate::runtime::http::{HttpExecutor, HttpRequest, HttpResult};
use crate::workflow::types::{EmailAction, HttpMethod, LlmAction, LogSinkAction, WorkflowEvent};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Replace every `{{ $.path }}` with the value found in `event`
///
/// Strings render bare, other values as JSON; missing paths render empty.
pub fn render_template(template: &str, event: &WorkflowEvent) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    let context = event.template_context();
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            rendered.push_str(&rest[start..]);
            return rendered;
        };

        let path = after_open[..end].trim();
        rendered.push_str(&resolve_path(&context, path));
        rest = &after_open[end + 2..];
    }

    rendered.push_str(rest);
    rendered
}

fn resolve_path(context: &Value, path: &str) -> String {
    match jsonpath_lib::select(context, path) {
        Ok(found) => match found.first() {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        },
        Err(e) => {
            tracing::warn!("⚠️ Invalid template path '{}': {}", path, e);
            String::new()
        }
    }
}

/// Executes the app-action node kinds
#[derive(Debug, Clone)]
pub struct ActionRunner {
    http: HttpExecutor,
    email: EmailConfig,
    llm: LlmConfig,
}

impl ActionRunner {
    pub fn new(http: HttpExecutor, email: EmailConfig, llm: LlmConfig) -> Self {
        Self { http, email, llm }
    }

    /// Deliver an email through the relay; the event passes through unchanged
    pub async fn send_email(&self, action: &EmailAction, event: &WorkflowEvent) -> Result<HttpResult, HttpError> {
        let relay_url = self.email.relay_url.clone().ok_or_else(|| HttpError::InvalidRequest {
            message: "no email relay configured".to_string(),
        })?;

        let mut headers = HashMap::new();
        if let Some(api_key) = &self.email.api_key {
            headers.insert("authorization".to_string(), format!("Bearer {api_key}"));
        }

        let render_all = |addresses: &[String]| -> Vec<String> {
            addresses.iter().map(|a| render_template(a, event)).collect()
        };
        let body = json!({
            "from": action.from.as_deref().map(|f| render_template(f, event)).unwrap_or_else(|| self.email.default_from.clone()),
            "to": render_all(&action.to),
            "cc": render_all(&action.cc),
            "subject": render_template(&action.subject, event),
            "body": render_template(&action.body, event),
        });

        tracing::info!("📧 Sending email '{}' to {} recipient(s)", body["subject"], action.to.len());
        let request = HttpRequest {
            url: relay_url,
            method: HttpMethod::Post,
            headers,
            body,
        };
        self.http
            .execute(
                &request,
                Duration::from_secs(action.timeout_seconds),
                &action.retry_config,
                action.failure_action,
            )
            .await
    }

    /// Run a completion against the messages API and return `{response, model, usage}`
    pub async fn complete(&self, action: &LlmAction, event: &WorkflowEvent) -> Result<Value, HttpError> {
        let api_key = self.llm.api_key.clone().ok_or_else(|| HttpError::InvalidRequest {
            message: "no LLM API key configured".to_string(),
        })?;

        let mut body = json!({
            "model": action.model,
            "max_tokens": action.max_tokens,
            "messages": [{ "role": "user", "content": render_template(&action.prompt, event) }],
        });
        if let Some(system) = &action.system_prompt {
            body["system"] = json!(render_template(system, event));
        }
        if let Some(temperature) = action.temperature {
            body["temperature"] = json!(temperature);
        }

        let headers = HashMap::from([
            ("x-api-key".to_string(), api_key),
            ("anthropic-version".to_string(), self.llm.api_version.clone()),
        ]);
        let request = HttpRequest {
            url: format!("{}/v1/messages", self.llm.base_url.trim_end_matches('/')),
            method: HttpMethod::Post,
            headers,
            body,
        };

        tracing::info!("🤖 Requesting completion from model {}", action.model);
        let result = self
            .http
            .execute(
                &request,
                Duration::from_secs(action.timeout_seconds),
                &action.retry_config,
                action.failure_action,
            )
            .await?;

        let text = result.body["content"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|block| block["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        Ok(json!({
            "response": text,
            "model": result.body.get("model").cloned().unwrap_or_else(|| json!(action.model)),
            "usage": result.body.get("usage").cloned().unwrap_or(Value::Null),
        }))
    }

    /// Ship the event data to an OpenObserve stream; the event passes through unchanged
    pub async fn ship_logs(&self, action: &LogSinkAction, event: &WorkflowEvent) -> Result<HttpResult, HttpError> {
        let mut headers = HashMap::new();
        if let Some(authorization) = &action.authorization {
            headers.insert("authorization".to_string(), authorization.clone());
        }

        let request = HttpRequest {
            url: format!("{}/{}/_json", action.url.trim_end_matches('/'), action.stream),
            method: HttpMethod::Post,
            headers,
            body: json!([event.data]),
        };

        tracing::debug!("📤 Shipping event to log stream '{}'", action.stream);
        self.http
            .execute(
                &request,
                Duration::from_secs(action.timeout_seconds),
                &action.retry_config,
                action.failure_action,
            )
            .await
    }
}
