//! OpenAI 兼容后端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（`{base_url}/chat/completions`）；base_url 可指向代理层或直连。
//! HTTP 状态映射为后端错误分类：429 -> rate_limited，5xx -> server_error，其余 4xx -> invalid，网络失败 -> transport。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{
    BackendError, CompletionRequest, ModelBackend, ModelEntry, ModelResponse, Usage,
};
use crate::memory::{Message, Role, ToolCall};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, usage: Usage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容后端：条目自带 base_url / api_key 时优先使用，否则退回后端默认值
pub struct OpenAiBackend {
    client: reqwest::Client,
    default_base_url: String,
    default_api_key: Option<String>,
    pub usage: TokenUsage,
}

impl OpenAiBackend {
    pub fn new(default_base_url: Option<&str>, default_api_key: Option<&str>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            default_base_url: default_base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            default_api_key: default_api_key
                .map(String::from)
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            usage: TokenUsage::default(),
        }
    }

    fn base_url<'a>(&'a self, model: &'a ModelEntry) -> &'a str {
        model
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .unwrap_or(&self.default_base_url)
    }

    fn api_key<'a>(&'a self, model: &'a ModelEntry) -> Option<&'a str> {
        model.api_key.as_deref().or(self.default_api_key.as_deref())
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, model: &ModelEntry) -> reqwest::RequestBuilder {
        match self.api_key(model) {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

/// Message -> OpenAI chat message
fn to_wire_message(m: &Message) -> Value {
    match m.role {
        Role::System => json!({ "role": "system", "content": m.content }),
        Role::User => json!({ "role": "user", "content": m.content }),
        Role::Assistant if !m.tool_calls.is_empty() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments.to_string() },
                    })
                })
                .collect();
            json!({ "role": "assistant", "content": m.content, "tool_calls": calls })
        }
        Role::Assistant => json!({ "role": "assistant", "content": m.content }),
        Role::Tool => json!({
            "role": "tool",
            "content": m.content,
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
        }),
    }
}

pub(crate) fn build_body(model: &ModelEntry, request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": model.model,
        "messages": request.messages.iter().map(to_wire_message).collect::<Vec<_>>(),
    });
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn parse_response(raw: &str) -> Result<ModelResponse, BackendError> {
    let parsed: ChatResponse = serde_json::from_str(raw)
        .map_err(|e| BackendError::server_error(format!("malformed response: {}", e)))?;
    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| BackendError::server_error("response has no choices"))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|c| {
            // 参数不是合法 JSON 时原样作为字符串交给工具层报错
            let arguments = serde_json::from_str(&c.function.arguments)
                .unwrap_or(Value::String(c.function.arguments));
            ToolCall {
                id: c.id,
                name: c.function.name,
                arguments,
            }
        })
        .collect();

    Ok(ModelResponse {
        content: message.content.unwrap_or_default(),
        tool_calls,
        usage: parsed.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    let detail: String = body.chars().take(300).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), detail);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        BackendError::rate_limited(message)
    } else if status.is_server_error() {
        BackendError::server_error(message)
    } else {
        BackendError::invalid(message)
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    BackendError::transport(e.to_string())
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn complete(
        &self,
        model: &ModelEntry,
        request: &CompletionRequest,
    ) -> Result<ModelResponse, BackendError> {
        let url = format!("{}/chat/completions", self.base_url(model));
        let body = build_body(model, request);

        let response = self
            .authorized(self.client.post(&url), model)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed = parse_response(&text)?;
        if let Some(usage) = parsed.usage {
            self.usage.add(usage);
        }
        Ok(parsed)
    }

    async fn probe(&self, model: &ModelEntry) -> Result<(), BackendError> {
        let url = format!("{}/models", self.base_url(model));
        let response = self
            .authorized(self.client.get(&url), model)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status, &text))
        }
    }
}
