//! 蜂群数据模型：AgentRecord、SwarmMessage、LogbookEntry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 根 Agent 的层级
pub const ROOT_TIER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "working" => AgentStatus::Working,
            "terminated" => AgentStatus::Terminated,
            _ => AgentStatus::Idle,
        }
    }
}

/// 持久化模式：ephemeral 可被 Sweeper 回收，persistent 只能显式终止
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    #[default]
    Ephemeral,
    Persistent,
}

impl PersistenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceMode::Ephemeral => "ephemeral",
            PersistenceMode::Persistent => "persistent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "persistent" => PersistenceMode::Persistent,
            _ => PersistenceMode::Ephemeral,
        }
    }
}

/// Agent 的持久记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub tier: u32,
    /// 写入后不可修改
    pub parent_id: Option<String>,
    pub status: AgentStatus,
    pub mission: String,
    /// 分配的模型角色或模型 id
    pub model_role: Option<String>,
    pub persistence: PersistenceMode,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, tier: u32, parent_id: Option<String>, mission: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            tier,
            parent_id,
            status: AgentStatus::Idle,
            mission: mission.into(),
            model_role: None,
            persistence: PersistenceMode::Ephemeral,
            created_at: now,
            last_active_at: now,
            terminated_at: None,
            termination_reason: None,
        }
    }

    pub fn with_model_role(mut self, model_role: Option<String>) -> Self {
        self.model_role = model_role;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceMode) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status != AgentStatus::Terminated
    }

    pub fn is_root(&self) -> bool {
        self.tier == ROOT_TIER
    }
}

/// 层级视图中的一个节点（按 parent_id 从扁平表组装）
#[derive(Debug, Clone, Serialize)]
pub struct AgentNode {
    #[serde(flatten)]
    pub record: AgentRecord,
    pub children: Vec<AgentNode>,
}

/// 由扁平记录组装层级；父节点不在列表中的记录作为顶层节点
pub fn build_hierarchy(records: Vec<AgentRecord>) -> Vec<AgentNode> {
    let ids: std::collections::HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
    let mut by_parent: std::collections::HashMap<Option<String>, Vec<AgentRecord>> =
        std::collections::HashMap::new();
    for record in records {
        let key = record.parent_id.clone().filter(|p| ids.contains(p));
        by_parent.entry(key).or_default().push(record);
    }

    fn attach(
        parent: Option<String>,
        by_parent: &mut std::collections::HashMap<Option<String>, Vec<AgentRecord>>,
    ) -> Vec<AgentNode> {
        let mut children = by_parent.remove(&parent).unwrap_or_default();
        children.sort_by(|a, b| (a.tier, a.created_at).cmp(&(b.tier, b.created_at)));
        children
            .into_iter()
            .map(|record| {
                let id = Some(record.id.clone());
                AgentNode {
                    children: attach(id, by_parent),
                    record,
                }
            })
            .collect()
    }

    attach(None, &mut by_parent)
}

/// 消息目标：指定 Agent 或主题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageTarget {
    Agent(String),
    Topic(String),
}

impl MessageTarget {
    pub fn encode(&self) -> (String, String) {
        match self {
            MessageTarget::Agent(id) => ("agent".to_string(), id.clone()),
            MessageTarget::Topic(t) => ("topic".to_string(), t.clone()),
        }
    }

    pub fn decode(kind: &str, value: String) -> Self {
        match kind {
            "topic" => MessageTarget::Topic(value),
            _ => MessageTarget::Agent(value),
        }
    }
}

/// 蜂群消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwarmMessage {
    pub id: String,
    pub sender_id: String,
    pub target: MessageTarget,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub delivered: bool,
}

impl SwarmMessage {
    pub fn new(sender_id: impl Into<String>, target: MessageTarget, payload: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            target,
            payload: payload.into(),
            timestamp: Utc::now(),
            delivered: false,
        }
    }

    /// 投递给 Agent 时作为输入的文本
    pub fn as_input(&self) -> String {
        format!("[message from {}] {}", self.sender_id, self.payload)
    }
}

/// Logbook 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Boot,
    Birth,
    Termination,
    CriticalFailure,
    SwarmAction,
    Reconciled,
    Shutdown,
}

impl LogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::Boot => "boot",
            LogEvent::Birth => "birth",
            LogEvent::Termination => "termination",
            LogEvent::CriticalFailure => "critical_failure",
            LogEvent::SwarmAction => "swarm_action",
            LogEvent::Reconciled => "reconciled",
            LogEvent::Shutdown => "shutdown",
        }
    }
}

/// Logbook 条目（只追加）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogbookEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<u32>,
    pub event: String,
    pub detail: String,
}

impl LogbookEntry {
    pub fn new(event: LogEvent, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_name: None,
            tier: None,
            event: event.as_str().to_string(),
            detail: detail.into(),
        }
    }

    pub fn for_agent(mut self, record: &AgentRecord) -> Self {
        self.agent_name = Some(record.name.clone());
        self.tier = Some(record.tier);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy_follows_parent_ids() {
        let root = AgentRecord::new("root", 1, None, "");
        let a = AgentRecord::new("a", 2, Some(root.id.clone()), "");
        let b = AgentRecord::new("b", 3, Some(a.id.clone()), "");
        let orphan = AgentRecord::new("orphan", 2, Some("gone".into()), "");

        let tree = build_hierarchy(vec![b.clone(), orphan, a.clone(), root.clone()]);
        assert_eq!(tree.len(), 2);
        let root_node = tree.iter().find(|n| n.record.id == root.id).unwrap();
        assert_eq!(root_node.children[0].record.id, a.id);
        assert_eq!(root_node.children[0].children[0].record.id, b.id);
    }

    #[test]
    fn test_logbook_entry_shape() {
        let record = AgentRecord::new("scout", 2, None, "");
        let entry = LogbookEntry::new(LogEvent::Birth, "spawned").for_agent(&record);
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["agentName"], "scout");
        assert_eq!(v["tier"], 2);
        assert_eq!(v["event"], "birth");
    }
}
