//! send_message 工具：给另一个 Agent 发消息，或向主题广播

use std::sync::Weak;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::swarm::{Delivery, SwarmManager};
use crate::tools::{caller_id, schema_of, swarm_manager, Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
struct SendArgs {
    /// 目标 Agent id（与 topic 二选一）
    #[serde(default)]
    to: Option<String>,
    /// 广播主题（与 to 二选一）
    #[serde(default)]
    topic: Option<String>,
    /// 消息内容
    message: String,
}

pub struct SendMessageTool {
    manager: Weak<SwarmManager>,
}

impl SendMessageTool {
    pub fn new(manager: Weak<SwarmManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to another agent by id (`to`), or broadcast it to a `topic`. Exactly one of the two must be given."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SendArgs>()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: SendArgs = serde_json::from_value(args).map_err(|e| format!("send_message: {}", e))?;
        let manager = swarm_manager(&self.manager)?;
        let sender = caller_id(ctx)?;

        match (args.to, args.topic) {
            (Some(to), None) => {
                if to == sender {
                    return Err("send_message: cannot message yourself".to_string());
                }
                let delivery = manager
                    .send_message(sender, &to, &args.message)
                    .await
                    .map_err(|e| e.to_string())?;
                let status = match delivery {
                    Delivery::Delivered => "delivered",
                    Delivery::Pending => "pending",
                };
                Ok(serde_json::json!({ "to": to, "status": status }).to_string())
            }
            (None, Some(topic)) => {
                let receivers = manager
                    .broadcast(sender, &topic, &args.message)
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::json!({ "topic": topic, "receivers": receivers }).to_string())
            }
            _ => Err("send_message: give exactly one of `to` or `topic`".to_string()),
        }
    }
}
