//! 错误分类
//!
//! 每层一个 thiserror 枚举；对外（控制面 / 终端）统一映射为稳定的 ErrorKind 字符串。

use serde::Serialize;
use thiserror::Error;

use crate::llm::{CatalogError, RouterError};

/// 对外稳定的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ResolutionError,
    CriticalFailure,
    SpawnRejected,
    InvalidRequest,
    NotFound,
    Cancelled,
    ShuttingDown,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResolutionError => "resolution_error",
            ErrorKind::CriticalFailure => "critical_failure",
            ErrorKind::SpawnRejected => "spawn_rejected",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次运行（run）级别的错误；工具错误不会出现在这里，它们在本地恢复后交给模型
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Agent not available: {0}")]
    Unavailable(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Router(RouterError::Resolution(_)) => ErrorKind::ResolutionError,
            AgentError::Router(RouterError::Exhausted { .. }) => ErrorKind::CriticalFailure,
            AgentError::Router(RouterError::Catalog(_)) => ErrorKind::InvalidRequest,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Unavailable(_) => ErrorKind::NotFound,
        }
    }
}

/// 蜂群生命周期错误（同步返回给调用方）
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Invalid tier {tier}: expected {expected}")]
    InvalidTier { tier: u32, expected: u32 },

    #[error("Tier {tier} exceeds max depth {max_depth}")]
    DepthExceeded { tier: u32, max_depth: u32 },

    #[error("Parent agent not found or not active: {0}")]
    ParentNotFound(String),

    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Root agent cannot be terminated: {0}")]
    RootProtected(String),

    #[error("Swarm is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),
}

impl SwarmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwarmError::InvalidTier { .. }
            | SwarmError::DepthExceeded { .. }
            | SwarmError::ParentNotFound(_) => ErrorKind::SpawnRejected,
            SwarmError::NotFound(_) => ErrorKind::NotFound,
            SwarmError::RootProtected(_) => ErrorKind::InvalidRequest,
            SwarmError::ShuttingDown => ErrorKind::ShuttingDown,
            SwarmError::Store(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("No pending request: {0}")]
    NotPending(String),

    #[error("Request timed out: {0}")]
    TimedOut(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApprovalError::NotPending(_) => ErrorKind::NotFound,
            ApprovalError::TimedOut(_) | ApprovalError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

pub fn catalog_error_kind(e: &CatalogError) -> ErrorKind {
    match e {
        CatalogError::NotFound(_) => ErrorKind::NotFound,
        CatalogError::DuplicateId(_) | CatalogError::BuiltInImmutable(_) => ErrorKind::InvalidRequest,
    }
}
