//! list_agents 工具：查看活跃 Agent 层级（可选包括墓地）

use std::sync::Weak;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::swarm::{AgentNode, SwarmManager};
use crate::tools::{schema_of, swarm_manager, Tool, ToolContext};

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct ListArgs {
    /// 同时列出已终止的 Agent
    #[serde(default)]
    include_graveyard: bool,
}

pub struct ListAgentsTool {
    manager: Weak<SwarmManager>,
}

impl ListAgentsTool {
    pub fn new(manager: Weak<SwarmManager>) -> Self {
        Self { manager }
    }
}

fn node_json(node: &AgentNode) -> Value {
    serde_json::json!({
        "id": node.record.id,
        "name": node.record.name,
        "tier": node.record.tier,
        "status": node.record.status,
        "mission": node.record.mission,
        "children": node.children.iter().map(node_json).collect::<Vec<_>>(),
    })
}

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List the active agent hierarchy (id, name, tier, status, mission). Set include_graveyard to also list terminated agents."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ListArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: ListArgs = if args.is_null() {
            ListArgs::default()
        } else {
            serde_json::from_value(args).map_err(|e| format!("list_agents: {}", e))?
        };
        let manager = swarm_manager(&self.manager)?;
        let hierarchy = manager.hierarchy().map_err(|e| e.to_string())?;
        let mut out = serde_json::json!({
            "agents": hierarchy.iter().map(node_json).collect::<Vec<_>>(),
        });
        if args.include_graveyard {
            let graveyard = manager.graveyard().map_err(|e| e.to_string())?;
            out["graveyard"] = graveyard
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "name": r.name,
                        "tier": r.tier,
                        "reason": r.termination_reason,
                        "terminated_at": r.terminated_at,
                    })
                })
                .collect::<Vec<_>>()
                .into();
        }
        Ok(out.to_string())
    }
}
