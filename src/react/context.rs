//! 会话上下文
//!
//! 结构：system（身份提示，永不丢失）| summary（压缩摘要，可无）| verbatim（最近的原始消息）。
//! summary 与 verbatim 的分界即压缩标记；压缩只会把 verbatim 的旧前缀并入 summary。
//! summary 有上限（软上限的一半，不低于 MIN_SUMMARY_CHARS），超出时丢弃最旧的行。

use crate::memory::{Message, Role};

const MIN_SUMMARY_CHARS: usize = 256;
const ELIDED_MARKER: &str = "(older summary lines dropped)";

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    system: Message,
    summary: Option<String>,
    messages: Vec<Message>,
    /// 软上限（字符数估算）
    soft_limit: usize,
    /// 压缩时保留的最近轮数
    keep_recent_turns: usize,
}

impl ConversationContext {
    pub fn new(system_prompt: impl Into<String>, soft_limit: usize, keep_recent_turns: usize) -> Self {
        Self {
            system: Message::system(system_prompt),
            summary: None,
            messages: Vec::new(),
            soft_limit,
            keep_recent_turns: keep_recent_turns.max(1),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system.content
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system = Message::system(prompt);
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn verbatim(&self) -> &[Message] {
        &self.messages
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.summary.is_none()
    }

    /// 发给模型的完整消息序列
    pub fn request_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 2);
        out.push(self.system.clone());
        if let Some(summary) = &self.summary {
            out.push(Message::summary(summary.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn size_estimate(&self) -> usize {
        self.system.size_estimate()
            + self.summary.as_ref().map(|s| s.len()).unwrap_or(0)
            + self.messages.iter().map(Message::size_estimate).sum::<usize>()
    }

    pub fn needs_compaction(&self) -> bool {
        self.size_estimate() > self.soft_limit && self.compaction_split() > 0
    }

    /// 可压缩前缀的长度：最近 keep_recent_turns 轮（以 User 消息开头）之前的所有消息
    pub fn compaction_split(&self) -> usize {
        let mut seen = 0;
        for (idx, message) in self.messages.iter().enumerate().rev() {
            if message.starts_turn() {
                seen += 1;
                if seen == self.keep_recent_turns {
                    return idx;
                }
            }
        }
        0
    }

    /// 用新的摘要替换前 `removed` 条 verbatim 消息
    pub fn apply_compaction(&mut self, summary: String, removed: usize) {
        let removed = removed.min(self.messages.len());
        self.messages.drain(..removed);
        self.summary = Some(cap_summary(summary, self.summary_budget()));
    }

    pub fn summary_budget(&self) -> usize {
        (self.soft_limit / 2).max(MIN_SUMMARY_CHARS)
    }

    /// 清空对话，保留身份提示
    pub fn reset(&mut self) {
        self.summary = None;
        self.messages.clear();
    }

    /// 持久化视图：摘要（如有）+ verbatim
    pub fn persistable(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(summary) = &self.summary {
            out.push(Message::summary(summary.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    /// 批量载入已持久化的消息；普通 system 消息忽略（身份提示由运行时提供）
    pub fn seed(&mut self, messages: Vec<Message>) {
        for message in messages {
            if message.summary {
                self.summary = Some(message.content);
            } else if message.role != Role::System {
                self.messages.push(message);
            }
        }
    }
}

/// 从后往前保留能放进预算的整行，最旧的行丢弃
fn cap_summary(summary: String, budget: usize) -> String {
    if summary.len() <= budget {
        return summary;
    }
    let room = budget.saturating_sub(ELIDED_MARKER.len() + 1);
    let mut kept = Vec::new();
    let mut used = 0;
    for line in summary.lines().rev().filter(|l| *l != ELIDED_MARKER) {
        if used + line.len() + 1 > room {
            break;
        }
        used += line.len() + 1;
        kept.push(line);
    }
    if kept.is_empty() {
        // 最后一行本身就超出预算：只留它的结尾
        let last = summary.lines().last().unwrap_or_default();
        let mut start = last.len().saturating_sub(room);
        while !last.is_char_boundary(start) {
            start += 1;
        }
        return format!("{}\n{}", ELIDED_MARKER, &last[start..]);
    }
    kept.reverse();
    format!("{}\n{}", ELIDED_MARKER, kept.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_turns(turns: usize) -> ConversationContext {
        let mut ctx = ConversationContext::new("identity", 10, 2);
        for i in 0..turns {
            ctx.push(Message::user(format!("question {i}")));
            ctx.push(Message::assistant(format!("answer {i}")));
        }
        ctx
    }

    #[test]
    fn test_split_keeps_recent_turns() {
        let ctx = ctx_with_turns(4);
        // 8 条消息，保留最后 2 轮 -> 前 4 条可压缩
        assert_eq!(ctx.compaction_split(), 4);
        assert!(ctx.needs_compaction());
    }

    #[test]
    fn test_nothing_to_compact_with_few_turns() {
        let ctx = ctx_with_turns(2);
        assert_eq!(ctx.compaction_split(), 0);
        assert!(!ctx.needs_compaction());
    }

    #[test]
    fn test_request_messages_order() {
        let mut ctx = ctx_with_turns(3);
        let split = ctx.compaction_split();
        ctx.apply_compaction("earlier".into(), split);
        let msgs = ctx.request_messages();
        assert_eq!(msgs[0].content, "identity");
        assert!(msgs[1].summary);
        assert_eq!(msgs[2].content, "question 1");
    }

    #[test]
    fn test_seed_restores_summary_and_skips_system() {
        let mut ctx = ConversationContext::new("identity", 1_000, 2);
        ctx.seed(vec![
            Message::system("old identity"),
            Message::summary("earlier"),
            Message::user("hi"),
        ]);
        assert_eq!(ctx.system_prompt(), "identity");
        assert_eq!(ctx.summary(), Some("earlier"));
        assert_eq!(ctx.verbatim().len(), 1);
        assert_eq!(ctx.persistable().len(), 2);
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut ctx = ctx_with_turns(2);
        ctx.reset();
        assert!(ctx.is_empty());
        assert_eq!(ctx.request_messages().len(), 1);
    }

    #[test]
    fn test_summary_is_capped_to_newest_lines() {
        let mut ctx = ConversationContext::new("identity", 600, 1);
        for i in 0..3 {
            ctx.push(Message::user(format!("question {i}")));
        }
        let long: Vec<String> = (0..40).map(|i| format!("- user: line {i:02} of the digest")).collect();
        let split = ctx.compaction_split();
        ctx.apply_compaction(long.join("\n"), split);

        let summary = ctx.summary().unwrap();
        assert!(summary.len() <= ctx.summary_budget());
        assert!(summary.starts_with(ELIDED_MARKER));
        assert!(summary.ends_with("line 39 of the digest"));
        assert!(!summary.contains("line 00 "));
        // 再次封顶不会叠加标记
        let again = summary.to_string();
        ctx.push(Message::user("question 3"));
        let split = ctx.compaction_split();
        ctx.apply_compaction(format!("{again}\n- user: newest"), split);
        assert_eq!(ctx.summary().unwrap().matches(ELIDED_MARKER).count(), 1);
        assert!(ctx.summary().unwrap().ends_with("- user: newest"));
    }

    #[test]
    fn test_single_oversized_line_keeps_its_tail() {
        let capped = cap_summary("a".repeat(300) + "end", 100);
        assert!(capped.len() <= 100);
        assert!(capped.ends_with("end"));
    }
}
