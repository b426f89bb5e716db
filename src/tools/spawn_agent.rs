//! spawn_agent 工具：在调用方之下生成一个子 Agent

use std::sync::Weak;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::swarm::{PersistenceMode, SpawnRequest, SwarmManager};
use crate::tools::{caller_id, schema_of, swarm_manager, Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
struct SpawnArgs {
    /// 子 Agent 名称
    name: String,
    /// 子 Agent 的任务
    mission: String,
    /// 模型角色（如 fast / thinking），缺省继承默认链
    #[serde(default)]
    model_role: Option<String>,
    /// 为 true 时不会被超时回收
    #[serde(default)]
    persistent: bool,
}

pub struct SpawnAgentTool {
    manager: Weak<SwarmManager>,
}

impl SpawnAgentTool {
    pub fn new(manager: Weak<SwarmManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent one tier below you with its own mission. It reports back to you by message when the mission is done."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SpawnArgs>()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: SpawnArgs = serde_json::from_value(args).map_err(|e| format!("spawn_agent: {}", e))?;
        let manager = swarm_manager(&self.manager)?;
        let parent_id = caller_id(ctx)?;
        let parent = manager
            .registry()
            .get_active(parent_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("calling agent {} is not active", parent_id))?;

        let persistence = if args.persistent {
            PersistenceMode::Persistent
        } else {
            PersistenceMode::Ephemeral
        };
        let request = SpawnRequest::child_of(&parent, args.name, args.mission)
            .with_model_role(args.model_role)
            .with_persistence(persistence);
        let spawned = manager.spawn(request).await.map_err(|e| e.to_string())?;
        Ok(serde_json::json!({
            "id": spawned.record.id,
            "name": spawned.record.name,
            "tier": spawned.record.tier,
            "created": spawned.created,
        })
        .to_string())
    }
}
