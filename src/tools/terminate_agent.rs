//! terminate_agent 工具：终止一个子 Agent（需审批）

use std::sync::Weak;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::swarm::SwarmManager;
use crate::tools::{caller_id, schema_of, swarm_manager, Tool, ToolContext};

#[derive(Debug, Deserialize, JsonSchema)]
struct TerminateArgs {
    /// 目标 Agent id
    id: String,
    /// 终止原因，缺省为 requested
    #[serde(default)]
    reason: Option<String>,
}

pub struct TerminateAgentTool {
    manager: Weak<SwarmManager>,
}

impl TerminateAgentTool {
    pub fn new(manager: Weak<SwarmManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for TerminateAgentTool {
    fn name(&self) -> &str {
        "terminate_agent"
    }

    fn description(&self) -> &str {
        "Terminate an agent by id and move it to the graveyard. Requires approval."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<TerminateArgs>()
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: TerminateArgs = serde_json::from_value(args).map_err(|e| format!("terminate_agent: {}", e))?;
        let manager = swarm_manager(&self.manager)?;
        if caller_id(ctx).ok() == Some(args.id.as_str()) {
            return Err("terminate_agent: an agent cannot terminate itself".to_string());
        }
        let reason = args.reason.unwrap_or_else(|| "requested".to_string());
        let terminated = manager
            .terminate(&args.id, &reason)
            .await
            .map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "id": args.id, "terminated": terminated, "reason": reason }).to_string())
    }
}
