//! Agent Registry（持久）与 Runtime Registry（内存）
//!
//! Agent Registry 是 AgentRecord 的唯一事实来源；Runtime Registry 只保存活跃 Agent 的运行句柄，
//! 重启即丢失，启动时由 Agent Registry 重建。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::react::AgentRuntime;
use crate::swarm::{AgentRecord, AgentStatus, Database, PersistenceMode, SwarmMessage, ROOT_TIER};

/// 持久 Agent 注册表
#[derive(Clone)]
pub struct AgentRegistry {
    db: Arc<Database>,
}

impl AgentRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn register(&self, record: &AgentRecord) -> rusqlite::Result<()> {
        self.db.insert_agent(record)
    }

    pub fn get(&self, id: &str) -> rusqlite::Result<Option<AgentRecord>> {
        self.db.get_agent(id)
    }

    /// 活跃记录（已终止的返回 None）
    pub fn get_active(&self, id: &str) -> rusqlite::Result<Option<AgentRecord>> {
        Ok(self.db.get_agent(id)?.filter(|r| r.is_active()))
    }

    pub fn update_status(&self, id: &str, status: AgentStatus) -> rusqlite::Result<bool> {
        self.db.update_status(id, status, Utc::now())
    }

    pub fn touch(&self, id: &str) -> rusqlite::Result<bool> {
        self.db.touch(id, Utc::now())
    }

    /// 指定活跃时间（回放 / 测试）
    pub fn touch_at(&self, id: &str, at: DateTime<Utc>) -> rusqlite::Result<bool> {
        self.db.touch(id, at)
    }

    pub fn find_by_name_and_tier(&self, name: &str, tier: u32) -> rusqlite::Result<Option<AgentRecord>> {
        self.db.find_active_by_name_and_tier(name, tier)
    }

    pub fn list_active(&self) -> rusqlite::Result<Vec<AgentRecord>> {
        self.db.list_active()
    }

    pub fn list_graveyard(&self) -> rusqlite::Result<Vec<AgentRecord>> {
        self.db.list_graveyard()
    }

    pub fn move_to_graveyard(&self, id: &str, reason: &str) -> rusqlite::Result<bool> {
        self.db.move_to_graveyard(id, reason, Utc::now())
    }

    /// 查找或创建根（幂等，不会出现第二个活跃根）。返回 (记录, 是否新建)
    pub fn ensure_root(&self, name: &str, mission: &str) -> rusqlite::Result<(AgentRecord, bool)> {
        let candidate = AgentRecord::new(name, ROOT_TIER, None, mission)
            .with_persistence(PersistenceMode::Persistent);
        self.db.ensure_root(&candidate)
    }
}

/// 单个活跃 Agent 的运行句柄
pub struct RuntimeHandle {
    pub agent_id: String,
    pub runtime: Arc<AgentRuntime>,
    cancel: CancellationToken,
    inbox: mpsc::UnboundedSender<SwarmMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeHandle {
    pub fn new(
        agent_id: impl Into<String>,
        runtime: Arc<AgentRuntime>,
        cancel: CancellationToken,
        inbox: mpsc::UnboundedSender<SwarmMessage>,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            runtime,
            cancel,
            inbox,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 投递到输入队列；worker 已退出时返回原消息
    pub fn deliver(&self, message: SwarmMessage) -> Result<(), SwarmMessage> {
        self.inbox.send(message).map_err(|e| e.0)
    }

    /// 停止：取消运行，等待 worker 退出（超时后强制中止）
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(grace, &mut worker).await.is_err() {
                tracing::warn!(agent_id = %self.agent_id, "Worker did not stop in time, aborting");
                worker.abort();
            }
        }
    }
}

/// 内存中的运行时注册表：id -> 句柄
#[derive(Default)]
pub struct RuntimeRegistry {
    handles: RwLock<HashMap<String, Arc<RuntimeHandle>>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: Arc<RuntimeHandle>) -> Option<Arc<RuntimeHandle>> {
        self.handles
            .write()
            .await
            .insert(handle.agent_id.clone(), handle)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RuntimeHandle>> {
        self.handles.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<RuntimeHandle>> {
        self.handles.write().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.handles.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// 取出全部句柄（关闭时使用）
    pub async fn drain(&self) -> Vec<Arc<RuntimeHandle>> {
        self.handles.write().await.drain().map(|(_, h)| h).collect()
    }
}
