//! 模型后端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ModelBackend：complete(model, messages, tools)，
//! 失败时返回带分类的 BackendError（rate_limited / server_error / invalid / transport），供 Router 决定重试或回退。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::llm::ModelEntry;
use crate::memory::{Message, ToolCall};

/// 暴露给模型的工具描述（名称 + 描述 + 参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 一次完成请求：消息序列 + 可用工具
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// token 使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// 后端返回：文本（最终回答或推理片段）+ 工具调用
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }
}

/// 后端错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// 限流（HTTP 429 等）
    RateLimited,
    /// 服务端暂时性错误（5xx）
    ServerError,
    /// 请求本身无效（鉴权、模型不存在、参数错误），对该候选是致命的
    Invalid,
    /// 网络层错误（连接失败、超时）
    Transport,
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendErrorKind::RateLimited => "rate_limited",
            BackendErrorKind::ServerError => "server_error",
            BackendErrorKind::Invalid => "invalid",
            BackendErrorKind::Transport => "transport",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::RateLimited, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::ServerError, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Invalid, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transport, message)
    }

    /// 暂时性错误：同一候选内可重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::ServerError | BackendErrorKind::Transport
        )
    }
}

/// 模型后端 trait
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// 对指定模型执行一次完成调用
    async fn complete(
        &self,
        model: &ModelEntry,
        request: &CompletionRequest,
    ) -> Result<ModelResponse, BackendError>;

    /// 启动时探测可达性；默认视为可达
    async fn probe(&self, _model: &ModelEntry) -> Result<(), BackendError> {
        Ok(())
    }
}
