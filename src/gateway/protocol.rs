//! 网关协议：入站帧与出站回复
//!
//! 出站流式事件直接使用 core::Envelope（`{type, sessionId?, ...fields}`）；
//! 这里只定义客户端发来的帧，以及对单个帧的回复。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{catalog_error_kind, AgentError, ApprovalError, ErrorKind, SwarmError};
use crate::llm::{CatalogError, RouterError, RoutingPolicy};

/// 客户端发来的帧
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// 用户消息，交给根 Agent
    Message {
        #[serde(rename = "sessionId")]
        session_id: String,
        content: String,
        #[serde(rename = "modelRole", default)]
        model_role: Option<String>,
        #[serde(rename = "modelId", default)]
        model_id: Option<String>,
    },
    /// 审批结果
    ApprovalResponse { id: String, approved: bool },
    /// 人工输入结果
    InputResponse { id: String, response: String },
    /// 控制面操作
    Control {
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
        #[serde(flatten)]
        request: ControlRequest,
    },
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, ErrorPayload> {
        serde_json::from_str(text)
            .map_err(|e| ErrorPayload::new(ErrorKind::InvalidRequest, format!("bad frame: {}", e)))
    }
}

/// 控制面操作（`op` 字段区分）
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    ListAgents,
    ListGraveyard,
    Spawn {
        name: String,
        /// 缺省为根 Agent
        #[serde(rename = "parentId", default)]
        parent_id: Option<String>,
        #[serde(default)]
        mission: String,
        #[serde(rename = "modelRole", default)]
        model_role: Option<String>,
        #[serde(default)]
        persistent: bool,
    },
    Terminate {
        id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    GetCatalog,
    AddModel {
        id: String,
        provider: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(rename = "baseUrl", default)]
        base_url: Option<String>,
        #[serde(rename = "apiKey", default)]
        api_key: Option<String>,
    },
    EditModel {
        id: String,
        #[serde(rename = "baseUrl", default)]
        base_url: Option<String>,
        #[serde(rename = "apiKey", default)]
        api_key: Option<String>,
    },
    RemoveModel { id: String },
    GetChains,
    UpdateChains { chains: HashMap<String, Vec<String>> },
    GetRouting,
    UpdateRouting { policy: RoutingPolicy },
    Logbook {
        #[serde(default = "default_logbook_limit")]
        limit: usize,
    },
    PendingApprovals,
    Status,
}

fn default_logbook_limit() -> usize {
    50
}

/// 对外稳定的错误载荷
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 终端前端使用的简短诊断
    pub fn diagnostic(&self) -> String {
        format!("error[{}]: {}", self.kind, self.message)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.diagnostic())
    }
}

impl From<AgentError> for ErrorPayload {
    fn from(e: AgentError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<SwarmError> for ErrorPayload {
    fn from(e: SwarmError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<ApprovalError> for ErrorPayload {
    fn from(e: ApprovalError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<CatalogError> for ErrorPayload {
    fn from(e: CatalogError) -> Self {
        Self::new(catalog_error_kind(&e), e.to_string())
    }
}

impl From<RouterError> for ErrorPayload {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Catalog(c) => c.into(),
            other => AgentError::Router(other).into(),
        }
    }
}

/// 对单个入站帧的回复
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameReply {
    /// 一次 run 的结果
    Result {
        #[serde(rename = "sessionId")]
        session_id: String,
        text: String,
        #[serde(rename = "traceId")]
        trace_id: String,
        truncated: bool,
    },
    /// 操作成功
    Ack {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Value,
    },
    Error {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(flatten)]
        error: ErrorPayload,
    },
}

impl FrameReply {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
