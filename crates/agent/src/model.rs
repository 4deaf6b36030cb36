//! Chat model seam and an OpenAI-compatible HTTP client.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ModelError;

/// One stateless round: system prompt, user snapshot and the tool schema.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub tools: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
}

#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete one round with a mandatory tool choice.
    async fn complete(&self, req: &ChatRequest) -> Result<ModelResponse, ModelError>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAiClient {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            url: completions_url(endpoint),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 4096,
            max_retries: 2,
            backoff: Duration::from_millis(500),
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    /// Retry count from `SCRIV_MODEL_RETRIES` when set.
    pub fn with_env_retries(self) -> Self {
        let n = std::env::var("SCRIV_MODEL_RETRIES").ok().and_then(|s| s.parse::<u32>().ok());
        match n {
            Some(n) => {
                let backoff = self.backoff;
                self.with_retries(n, backoff)
            }
            None => self,
        }
    }

    fn body(&self, req: &ChatRequest) -> Value {
        json!({
            "model": &self.model,
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": &req.system},
                {"role": "user", "content": &req.user}
            ],
            "tools": &req.tools,
            "tool_choice": "required"
        })
    }

    async fn send_once(&self, body: &Value) -> Result<ModelResponse, ModelError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| ModelError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ModelError::Status { status: status.as_u16(), body: crate::config::preview(&text, 500) });
        }
        debug!(bytes = text.len(), "model response");
        parse_response(&text)
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, req: &ChatRequest) -> Result<ModelResponse, ModelError> {
        let body = self.body(req);
        let mut attempt = 0u32;
        loop {
            match self.send_once(&body).await {
                Ok(r) => return Ok(r),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff.saturating_mul(1u32 << attempt.min(16));
                    warn!(error = %e, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "model call failed; retrying");
                    metrics::counter!("agent_model_retries_total", 1u64);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn completions_url(endpoint: &str) -> String {
    let base = endpoint.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{}/chat/completions", base)
    }
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

pub(crate) fn parse_response(text: &str) -> Result<ModelResponse, ModelError> {
    let wire: WireResponse = serde_json::from_str(text).map_err(|e| ModelError::Decode(e.to_string()))?;
    let choice = wire.choices.into_iter().next().ok_or(ModelError::Empty)?;
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| RawToolCall {
            id: c.id,
            name: c.function.name,
            // Some providers send an object instead of the encoded string.
            arguments: match c.function.arguments {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            },
        })
        .collect();
    Ok(ModelResponse { content: choice.message.content.filter(|c| !c.trim().is_empty()), tool_calls })
}
