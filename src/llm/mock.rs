//! Mock 后端（用于测试，无需 API）
//!
//! 按模型 id 排队预设的响应 / 错误并统计尝试次数；队列为空时回显最后一条 User 消息作为最终回答。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{BackendError, CompletionRequest, ModelBackend, ModelEntry, ModelResponse};
use crate::memory::Role;

type Scripted = Result<ModelResponse, BackendError>;

/// 可编排的 Mock 后端
#[derive(Debug, Default)]
pub struct MockBackend {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    attempts: Mutex<HashMap<String, u32>>,
    unreachable: Mutex<Vec<String>>,
    latency: Option<Duration>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次调用前等待（用于取消 / 并发测试）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 为某个模型 id 追加一条预设结果
    pub fn push(&self, model_id: &str, result: Scripted) -> &Self {
        self.scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(model_id.to_string())
            .or_default()
            .push_back(result);
        self
    }

    /// probe 时报告不可达
    pub fn mark_unreachable(&self, model_id: &str) {
        self.unreachable
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(model_id.to_string());
    }

    /// 某个模型被调用的次数
    pub fn attempts(&self, model_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(model_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .sum()
    }

    fn echo(request: &CompletionRequest) -> ModelResponse {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        ModelResponse::text(format!("Echo from Mock: {}", last_user))
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    async fn complete(
        &self,
        model: &ModelEntry,
        request: &CompletionRequest,
    ) -> Result<ModelResponse, BackendError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        *self
            .attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(model.id.clone())
            .or_insert(0) += 1;

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&model.id)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(result) => result,
            None => Ok(Self::echo(request)),
        }
    }

    async fn probe(&self, model: &ModelEntry) -> Result<(), BackendError> {
        let unreachable = self.unreachable.lock().unwrap_or_else(|p| p.into_inner());
        if unreachable.contains(&model.id) {
            return Err(BackendError::transport(format!("{} unreachable", model.id)));
        }
        Ok(())
    }
}
