//! Swarm Messenger：Agent 间消息
//!
//! 每条消息先持久化；目标有活跃句柄时同时进入其输入队列。消息在目标的一次运行处理完之后才确认，
//! 在此之前一直是待取状态：worker 被取消或进程重启时，下次启动的 worker 会重新取走它（至少一次）。
//! 主题广播走与外部事件流相同的总线。

use std::sync::Arc;

use crate::core::{Envelope, Event, EventBus, SwarmError};
use crate::swarm::{Database, MessageTarget, RuntimeRegistry, SwarmMessage};

/// 点对点投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 已进入目标输入队列（处理完成后确认）
    Delivered,
    /// 目标暂无活跃句柄，已持久化待取
    Pending,
}

pub struct SwarmMessenger {
    db: Arc<Database>,
    runtimes: Arc<RuntimeRegistry>,
    bus: Arc<EventBus>,
}

impl SwarmMessenger {
    pub fn new(db: Arc<Database>, runtimes: Arc<RuntimeRegistry>, bus: Arc<EventBus>) -> Self {
        Self { db, runtimes, bus }
    }

    /// 点对点发送；目标不是活跃 Agent 时消息仍会被记录，但返回 NotFound
    pub async fn send(
        &self,
        sender_id: &str,
        target_id: &str,
        payload: &str,
    ) -> Result<Delivery, SwarmError> {
        let message = SwarmMessage::new(sender_id, MessageTarget::Agent(target_id.to_string()), payload);
        self.db.insert_message(&message)?;

        if let Some(handle) = self.runtimes.get(target_id).await {
            match handle.deliver(message) {
                Ok(()) => {
                    tracing::debug!(sender_id, target_id, "Swarm message delivered");
                    return Ok(Delivery::Delivered);
                }
                Err(_) => {
                    tracing::warn!(target_id, "Inbox closed, message left pending");
                }
            }
        }

        match self.db.get_agent(target_id)? {
            Some(record) if record.is_active() => Ok(Delivery::Pending),
            _ => Err(SwarmError::NotFound(target_id.to_string())),
        }
    }

    /// 主题广播；返回收到事件的订阅者数量
    pub fn broadcast(&self, sender_id: &str, topic: &str, payload: &str) -> Result<usize, SwarmError> {
        let mut message = SwarmMessage::new(sender_id, MessageTarget::Topic(topic.to_string()), payload);
        message.delivered = true;
        self.db.insert_message(&message)?;

        let envelope = Envelope::new(Event::SwarmMessage {
            sender_id: sender_id.to_string(),
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
        .with_agent(sender_id);
        Ok(self.bus.publish_topic(topic, envelope))
    }

    /// 某 Agent 尚未确认的消息
    pub fn pending_for(&self, agent_id: &str) -> Result<Vec<SwarmMessage>, SwarmError> {
        Ok(self.db.pending_messages(agent_id)?)
    }

    /// 确认一条消息已被处理
    pub fn ack(&self, message_id: &str) -> Result<(), SwarmError> {
        Ok(self.db.mark_delivered(message_id)?)
    }
}
