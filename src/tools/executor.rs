//! 工具执行器
//!
//! 对每次调用：查找工具 -> 校验参数 -> （需要时）审批 -> 在超时内执行；任何失败都转成结构化 ToolError，
//! 作为工具结果交回模型，不会中断运行。每次调用输出结构化审计日志（JSON）。
//! 同一轮的多个调用在该轮自己的许可池内有界并发执行，结果顺序与调用顺序一致。
//! 审批在取得许可之前完成，等待审批不占用扇出名额。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::timeout;

use crate::core::{ApprovalContext, ApprovalDecision, ApprovalGate, TaskScheduler, ToolTurn};
use crate::memory::{Message, ToolCall};
use crate::tools::{ToolContext, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Failed,
    Timeout,
    UnknownTool,
    InvalidArguments,
    Denied,
}

impl ToolErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Failed => "failed",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::Denied => "denied",
        }
    }
}

/// 结构化工具错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// 单个调用的结果（与调用 1:1 配对）
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call: ToolCall,
    pub result: Result<String, ToolError>,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// 交给模型的文本：成功为原始输出，失败为 `{"error": kind, "message": ...}`
    pub fn content(&self) -> String {
        match &self.result {
            Ok(output) => output.clone(),
            Err(e) => serde_json::json!({ "error": e.kind, "message": e.message }).to_string(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::tool_result(self.call.id.clone(), self.content())
    }
}

/// 工具执行器：超时 + 审批 + 审计
pub struct ToolExecutor {
    timeout: Duration,
    scheduler: TaskScheduler,
    approvals: Arc<dyn ApprovalGate>,
}

impl ToolExecutor {
    pub fn new(timeout: Duration, scheduler: TaskScheduler, approvals: Arc<dyn ApprovalGate>) -> Self {
        Self {
            timeout,
            scheduler,
            approvals,
        }
    }

    /// 执行一轮内的全部调用；单个失败不影响其他调用
    pub async fn execute_batch(
        &self,
        registry: &ToolRegistry,
        ctx: &ToolContext,
        calls: &[ToolCall],
    ) -> Vec<ToolOutcome> {
        let turn = self.scheduler.turn();
        join_all(calls.iter().map(|call| self.execute_in(registry, ctx, call, Some(&turn)))).await
    }

    /// 执行单个调用
    pub async fn execute(&self, registry: &ToolRegistry, ctx: &ToolContext, call: &ToolCall) -> ToolOutcome {
        self.execute_in(registry, ctx, call, None).await
    }

    async fn execute_in(
        &self,
        registry: &ToolRegistry,
        ctx: &ToolContext,
        call: &ToolCall,
        turn: Option<&ToolTurn>,
    ) -> ToolOutcome {
        let start = Instant::now();
        let result = self.run_call(registry, ctx, call, turn).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind.as_str(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "call_id": call.id,
            "agent_id": ctx.agent_id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&call.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        ToolOutcome {
            call: call.clone(),
            result,
            duration_ms,
        }
    }

    async fn run_call(
        &self,
        registry: &ToolRegistry,
        ctx: &ToolContext,
        call: &ToolCall,
        turn: Option<&ToolTurn>,
    ) -> Result<String, ToolError> {
        let tool = registry.get(&call.name).ok_or_else(|| {
            ToolError::new(
                ToolErrorKind::UnknownTool,
                format!("Unknown tool: {}", call.name),
            )
        })?;

        if !call.arguments.is_object() {
            return Err(ToolError::new(
                ToolErrorKind::InvalidArguments,
                format!("arguments must be a JSON object, got: {}", args_preview(&call.arguments)),
            ));
        }

        if tool.requires_approval() {
            let decision = self
                .approvals
                .request_approval(ApprovalContext {
                    kind: call.name.clone(),
                    description: format!("{} {}", call.name, args_preview(&call.arguments)),
                    session_id: Some(ctx.session_id.clone()),
                    agent_id: ctx.agent_id.clone(),
                })
                .await;
            if let ApprovalDecision::Denied(reason) = decision {
                return Err(ToolError::new(ToolErrorKind::Denied, reason));
            }
        }

        let _permit = match turn {
            Some(turn) => turn.acquire().await,
            None => None,
        };
        match timeout(self.timeout, tool.execute(ctx, call.arguments.clone())).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ToolError::new(ToolErrorKind::Failed, e)),
            Err(_) => Err(ToolError::new(
                ToolErrorKind::Timeout,
                format!("{} timed out after {}s", call.name, self.timeout.as_secs()),
            )),
        }
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
