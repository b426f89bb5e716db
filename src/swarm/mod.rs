//! 蜂群子系统：根 Agent 之下的 Agent 群体（注册、消息、生成、回收、审计）

pub mod logbook;
pub mod manager;
pub mod messenger;
pub mod record;
pub mod registry;
pub mod store;
pub mod sweeper;

pub use logbook::Logbook;
pub use manager::{SpawnRequest, Spawned, SwarmManager, SwarmSettings};
pub use messenger::{Delivery, SwarmMessenger};
pub use record::{
    build_hierarchy, AgentNode, AgentRecord, AgentStatus, LogEvent, LogbookEntry, MessageTarget,
    PersistenceMode, SwarmMessage, ROOT_TIER,
};
pub use registry::{AgentRegistry, RuntimeHandle, RuntimeRegistry};
pub use store::Database;
pub use sweeper::{SwarmSweeper, SweepPolicy};
