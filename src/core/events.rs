//! 事件总线：流式事件信封与发布 / 订阅
//!
//! 运行时步骤事件、临界失败通知、审批请求与蜂群广播共用同一条总线。
//! 投递是尽力而为的：订阅者落后时丢弃最旧事件，不回放。

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::broadcast;

/// 总线事件（序列化为 `{"type": "...", ...fields}`）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// 当前步数
    StepUpdate { step: usize, max_steps: usize },
    /// 推理片段（模型在调用工具前给出的文本）
    Reasoning { delta: String },
    /// 工具调用
    ToolCall {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    /// 工具结果（预览）
    ToolResult {
        call_id: String,
        tool: String,
        ok: bool,
        preview: String,
    },
    /// token 使用量
    Usage {
        model_id: String,
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// 上下文压缩
    Compacted { removed: usize },
    /// 最终回答
    FinalAnswer { delta: String, trace_id: String },
    /// 所有候选模型都失败
    CriticalFailure { label: String, errors: Vec<String> },
    /// 需要人工审批
    ApprovalRequest {
        id: String,
        kind: String,
        description: String,
    },
    /// 需要人工输入
    InputRequest { id: String, prompt: String },
    /// 蜂群消息（主题广播）
    SwarmMessage {
        sender_id: String,
        topic: String,
        payload: String,
    },
    AgentSpawned {
        agent_id: String,
        name: String,
        tier: u32,
    },
    AgentTerminated { agent_id: String, reason: String },
    /// 运行错误（稳定的错误类别 + 描述）
    Error { kind: String, message: String },
}

/// 事件信封
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    pub fn new(event: Event) -> Self {
        Self {
            session_id: None,
            agent_id: None,
            event,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 发布 / 订阅总线：一条全局 feed + 按主题的子通道
pub struct EventBus {
    feed: broadcast::Sender<Envelope>,
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (feed, _) = broadcast::channel(capacity);
        Self {
            feed,
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// 订阅全局 feed
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.feed.subscribe()
    }

    /// 订阅某个主题
    pub fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<Envelope> {
        let mut topics = self.topics.write().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// 发布到全局 feed；返回收到事件的订阅者数量
    pub fn publish(&self, envelope: Envelope) -> usize {
        self.feed.send(envelope).unwrap_or(0)
    }

    /// 发布到主题（同时进入全局 feed）
    pub fn publish_topic(&self, topic: &str, envelope: Envelope) -> usize {
        let topic_receivers = {
            let topics = self.topics.read().unwrap_or_else(|p| p.into_inner());
            topics
                .get(topic)
                .map(|tx| tx.send(envelope.clone()).unwrap_or(0))
                .unwrap_or(0)
        };
        topic_receivers + self.publish(envelope)
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
