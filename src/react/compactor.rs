//! 上下文压缩
//!
//! 超过软上限时，把最近 N 轮之前的 verbatim 消息折叠成一条摘要。
//! 已有摘要原样保留在新摘要开头，不会被再次总结；重复执行时没有可折叠的前缀，即为幂等。
//! 摘要总长由 ConversationContext 封顶，长对话的上下文保持在软上限附近。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, ModelRouter};
use crate::memory::{Message, Role};
use crate::react::ConversationContext;

/// 单行摘要的最大字符数
const DIGEST_LINE_CHARS: usize = 160;

/// 摘要生成器
#[async_trait]
pub trait Compactor: Send + Sync {
    /// 生成新的摘要；`previous` 为已有摘要，需原样并入
    async fn summarize(&self, previous: Option<&str>, messages: &[Message]) -> String;
}

/// 逐条摘录（不调用模型）
#[derive(Debug, Clone, Default)]
pub struct DigestCompactor;

impl DigestCompactor {
    fn line(message: &Message) -> Option<String> {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => return None,
        };
        if !message.tool_calls.is_empty() {
            let names: Vec<&str> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
            return Some(format!("- assistant called: {}", names.join(", ")));
        }
        let text = message.content.trim();
        if text.is_empty() {
            return None;
        }
        let mut clipped: String = text.chars().take(DIGEST_LINE_CHARS).collect();
        if text.chars().count() > DIGEST_LINE_CHARS {
            clipped.push_str("...");
        }
        Some(format!("- {}: {}", role, clipped.replace('\n', " ")))
    }

    pub fn digest(previous: Option<&str>, messages: &[Message]) -> String {
        let mut out = String::new();
        if let Some(previous) = previous {
            out.push_str(previous);
            out.push('\n');
        }
        out.push_str("Earlier conversation:");
        for line in messages.iter().filter_map(Self::line) {
            out.push('\n');
            out.push_str(&line);
        }
        out
    }
}

#[async_trait]
impl Compactor for DigestCompactor {
    async fn summarize(&self, previous: Option<&str>, messages: &[Message]) -> String {
        Self::digest(previous, messages)
    }
}

/// 让模型写摘要；失败时退回逐条摘录
pub struct ModelCompactor {
    router: Arc<ModelRouter>,
    role: Option<String>,
}

impl ModelCompactor {
    pub fn new(router: Arc<ModelRouter>, role: Option<String>) -> Self {
        Self { router, role }
    }
}

#[async_trait]
impl Compactor for ModelCompactor {
    async fn summarize(&self, previous: Option<&str>, messages: &[Message]) -> String {
        let transcript = DigestCompactor::digest(None, messages);
        let request = CompletionRequest {
            messages: vec![
                Message::system(
                    "Summarize the conversation excerpt in a few bullet points. \
                     Keep facts, decisions, names and open tasks. Do not add anything new.",
                ),
                Message::user(transcript),
            ],
            tools: Vec::new(),
        };
        match self
            .router
            .route(self.role.as_deref(), Some("summarize"), &request)
            .await
        {
            Ok(routed) if !routed.response.content.trim().is_empty() => {
                let summary = routed.response.content.trim();
                match previous {
                    Some(previous) => format!("{}\n{}", previous, summary),
                    None => summary.to_string(),
                }
            }
            Ok(_) => DigestCompactor::digest(previous, messages),
            Err(e) => {
                tracing::warn!("Model summary failed, using digest: {}", e);
                DigestCompactor::digest(previous, messages)
            }
        }
    }
}

/// 压缩上下文；返回被折叠的消息数（0 表示无事可做）
pub async fn compact(ctx: &mut ConversationContext, compactor: &dyn Compactor) -> usize {
    let split = ctx.compaction_split();
    if split == 0 {
        return 0;
    }
    let summary = compactor
        .summarize(ctx.summary(), &ctx.verbatim()[..split])
        .await;
    ctx.apply_compaction(summary, split);
    split
}
