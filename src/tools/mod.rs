//! 工具层：注册表、执行器与内置工具（echo + 蜂群工具）

pub mod echo;
pub mod executor;
pub mod list_agents;
pub mod registry;
pub mod schema;
pub mod send_message;
pub mod spawn_agent;
pub mod terminate_agent;

use std::sync::{Arc, Weak};

pub use echo::EchoTool;
pub use executor::{ToolError, ToolErrorKind, ToolExecutor, ToolOutcome};
pub use list_agents::ListAgentsTool;
pub use registry::{Tool, ToolCatalog, ToolContext, ToolRegistry};
pub use schema::schema_of;
pub use send_message::SendMessageTool;
pub use spawn_agent::SpawnAgentTool;
pub use terminate_agent::TerminateAgentTool;

use crate::swarm::SwarmManager;

/// 注册蜂群工具；工具只持有 Weak，不延长 SwarmManager 的生命周期
pub fn register_swarm_tools(registry: &mut ToolRegistry, manager: &Arc<SwarmManager>) {
    registry.register(SpawnAgentTool::new(Arc::downgrade(manager)));
    registry.register(SendMessageTool::new(Arc::downgrade(manager)));
    registry.register(ListAgentsTool::new(Arc::downgrade(manager)));
    registry.register(TerminateAgentTool::new(Arc::downgrade(manager)));
}

pub(crate) fn swarm_manager(manager: &Weak<SwarmManager>) -> Result<Arc<SwarmManager>, String> {
    manager
        .upgrade()
        .ok_or_else(|| "swarm is not available".to_string())
}

pub(crate) fn caller_id(ctx: &ToolContext) -> Result<&str, String> {
    ctx.agent_id
        .as_deref()
        .ok_or_else(|| "this tool must be called by a swarm agent".to_string())
}
