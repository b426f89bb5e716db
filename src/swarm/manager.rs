//! Swarm Manager：生成、终止、启动对账与回收
//!
//! 层级以扁平表保存，parent_id 只是查找键。每个活跃 Agent 有一个 inbox worker：
//! 先处理持久化的待取消息，再循环消费输入队列，直到被取消。每条消息在运行结束后才确认。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Envelope, Event, EventBus, SwarmError};
use crate::react::{AgentIdentity, AgentRuntime, RunOptions, RuntimeDeps};
use crate::swarm::{
    build_hierarchy, AgentNode, AgentRecord, AgentRegistry, AgentStatus, Database, Delivery,
    LogEvent, Logbook, LogbookEntry, PersistenceMode, RuntimeHandle, RuntimeRegistry,
    SweepPolicy, SwarmMessage, SwarmMessenger, ROOT_TIER,
};

/// 蜂群参数
#[derive(Debug, Clone)]
pub struct SwarmSettings {
    /// 最大层级（根为 1）
    pub max_depth: u32,
    pub root_name: String,
    pub root_mission: String,
    /// 终止时等待 worker 退出的时间
    pub stop_grace: Duration,
    /// 生成后立即执行 mission 并向父 Agent 汇报
    pub run_mission_on_spawn: bool,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            max_depth: 4,
            root_name: "queen".to_string(),
            root_mission: "Coordinate the swarm and answer the user.".to_string(),
            stop_grace: Duration::from_secs(5),
            run_mission_on_spawn: true,
        }
    }
}

/// 生成请求
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub tier: u32,
    pub parent_id: Option<String>,
    pub mission: String,
    pub model_role: Option<String>,
    pub persistence: PersistenceMode,
}

impl SpawnRequest {
    /// 在 `parent` 之下生成一层
    pub fn child_of(parent: &AgentRecord, name: impl Into<String>, mission: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: parent.tier + 1,
            parent_id: Some(parent.id.clone()),
            mission: mission.into(),
            model_role: None,
            persistence: PersistenceMode::Ephemeral,
        }
    }

    pub fn with_model_role(mut self, role: Option<String>) -> Self {
        self.model_role = role;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceMode) -> Self {
        self.persistence = persistence;
        self
    }
}

/// 生成结果
#[derive(Debug, Clone)]
pub struct Spawned {
    pub record: AgentRecord,
    /// false 表示返回的是已存在的同名活跃 Agent
    pub created: bool,
}

pub struct SwarmManager {
    settings: SwarmSettings,
    registry: AgentRegistry,
    runtimes: Arc<RuntimeRegistry>,
    messenger: Arc<SwarmMessenger>,
    logbook: Arc<Logbook>,
    bus: Arc<EventBus>,
    deps: RuntimeDeps,
    base_prompt: String,
    accepting: AtomicBool,
    /// 生成 / 关闭互斥，保证关闭后不会再插入句柄
    lifecycle: Mutex<()>,
    root_id: RwLock<Option<String>>,
}

impl SwarmManager {
    pub fn new(
        settings: SwarmSettings,
        db: Arc<Database>,
        logbook: Arc<Logbook>,
        deps: RuntimeDeps,
        base_prompt: impl Into<String>,
    ) -> Arc<Self> {
        let runtimes = Arc::new(RuntimeRegistry::new());
        let bus = Arc::clone(&deps.bus);
        let messenger = Arc::new(SwarmMessenger::new(
            Arc::clone(&db),
            Arc::clone(&runtimes),
            Arc::clone(&bus),
        ));
        Arc::new(Self {
            settings,
            registry: AgentRegistry::new(db),
            runtimes,
            messenger,
            logbook,
            bus,
            deps,
            base_prompt: base_prompt.into(),
            accepting: AtomicBool::new(true),
            lifecycle: Mutex::new(()),
            root_id: RwLock::new(None),
        })
    }

    pub fn settings(&self) -> &SwarmSettings {
        &self.settings
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn runtimes(&self) -> &Arc<RuntimeRegistry> {
        &self.runtimes
    }

    pub fn messenger(&self) -> &Arc<SwarmMessenger> {
        &self.messenger
    }

    pub fn logbook(&self) -> &Arc<Logbook> {
        &self.logbook
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn root_id(&self) -> Option<String> {
        self.root_id.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// 启动：查找或创建根，并为没有句柄的活跃记录重建运行时
    pub async fn boot(&self) -> Result<AgentRecord, SwarmError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_accepting() {
            return Err(SwarmError::ShuttingDown);
        }
        let (root, created) = self
            .registry
            .ensure_root(&self.settings.root_name, &self.settings.root_mission)?;
        *self.root_id.write().unwrap_or_else(|p| p.into_inner()) = Some(root.id.clone());

        let active = self.registry.list_active()?;
        self.logbook.append(LogbookEntry::new(
            LogEvent::Boot,
            format!("root {} ({} active agents)", root.id, active.len()),
        ));
        if created {
            self.logbook.append(LogbookEntry::new(LogEvent::Birth, "root created").for_agent(&root));
            self.publish_spawned(&root);
        }

        for record in active {
            if self.runtimes.contains(&record.id).await {
                continue;
            }
            self.start_runtime(&record, None).await;
            if !record.is_root() {
                self.logbook.append(
                    LogbookEntry::new(LogEvent::Reconciled, format!("runtime rebuilt for {}", record.id))
                        .for_agent(&record),
                );
            }
        }
        tracing::info!(root_id = %root.id, created, "Swarm booted");
        Ok(root)
    }

    /// 根 Agent 的运行句柄
    pub async fn root(&self) -> Result<Arc<RuntimeHandle>, SwarmError> {
        let root_id = self
            .root_id()
            .ok_or_else(|| SwarmError::NotFound("root".to_string()))?;
        self.observe(&root_id).await
    }

    /// 生成 Agent；校验失败时不产生任何状态
    pub async fn spawn(&self, request: SpawnRequest) -> Result<Spawned, SwarmError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_accepting() {
            return Err(SwarmError::ShuttingDown);
        }

        if request.tier == ROOT_TIER && request.parent_id.is_none() {
            let (record, created) = self.registry.ensure_root(&request.name, &request.mission)?;
            *self.root_id.write().unwrap_or_else(|p| p.into_inner()) = Some(record.id.clone());
            if !self.runtimes.contains(&record.id).await {
                self.start_runtime(&record, None).await;
            }
            return Ok(Spawned { record, created });
        }

        let parent_id = request
            .parent_id
            .clone()
            .ok_or(SwarmError::InvalidTier { tier: request.tier, expected: ROOT_TIER })?;
        let parent = self
            .registry
            .get_active(&parent_id)?
            .ok_or_else(|| SwarmError::ParentNotFound(parent_id.clone()))?;
        if request.tier != parent.tier + 1 {
            return Err(SwarmError::InvalidTier {
                tier: request.tier,
                expected: parent.tier + 1,
            });
        }
        if request.tier > self.settings.max_depth {
            return Err(SwarmError::DepthExceeded {
                tier: request.tier,
                max_depth: self.settings.max_depth,
            });
        }

        if let Some(existing) = self.registry.find_by_name_and_tier(&request.name, request.tier)? {
            if existing.parent_id.as_deref() == Some(parent_id.as_str()) {
                tracing::debug!(agent_id = %existing.id, "Spawn matched existing agent");
                return Ok(Spawned { record: existing, created: false });
            }
        }

        let record = AgentRecord::new(&request.name, request.tier, Some(parent_id), &request.mission)
            .with_model_role(request.model_role.clone())
            .with_persistence(request.persistence);
        self.registry.register(&record)?;

        let mission = if self.settings.run_mission_on_spawn && !record.mission.trim().is_empty() {
            Some(record.mission.clone())
        } else {
            None
        };
        self.start_runtime(&record, mission).await;

        self.logbook.append(
            LogbookEntry::new(
                LogEvent::Birth,
                format!("spawned by {} with mission: {}", parent.name, record.mission),
            )
            .for_agent(&record),
        );
        self.publish_spawned(&record);
        tracing::info!(agent_id = %record.id, name = %record.name, tier = record.tier, "Agent spawned");
        Ok(Spawned { record, created: true })
    }

    /// 终止 Agent。已终止时为 no-op（返回 false），原因与时间戳保持不变
    pub async fn terminate(&self, id: &str, reason: &str) -> Result<bool, SwarmError> {
        let record = self
            .registry
            .get(id)?
            .ok_or_else(|| SwarmError::NotFound(id.to_string()))?;
        if !record.is_active() {
            return Ok(false);
        }
        if record.is_root() {
            return Err(SwarmError::RootProtected(id.to_string()));
        }

        if let Some(handle) = self.runtimes.remove(id).await {
            handle.stop(self.settings.stop_grace).await;
        }
        let moved = self.registry.move_to_graveyard(id, reason)?;
        if moved {
            self.logbook.append(
                LogbookEntry::new(LogEvent::Termination, format!("terminated: {}", reason))
                    .for_agent(&record),
            );
            self.bus.publish(
                Envelope::new(Event::AgentTerminated {
                    agent_id: id.to_string(),
                    reason: reason.to_string(),
                })
                .with_agent(id),
            );
            tracing::info!(agent_id = %id, reason, "Agent terminated");
        }
        Ok(moved)
    }

    /// 对账单个 Agent：活跃但没有句柄时重建；有句柄但记录已终止时移除句柄
    pub async fn observe(&self, id: &str) -> Result<Arc<RuntimeHandle>, SwarmError> {
        let record = self.registry.get_active(id)?;
        let handle = self.runtimes.get(id).await;
        match (record, handle) {
            (Some(_), Some(handle)) => Ok(handle),
            (Some(record), None) => {
                let _guard = self.lifecycle.lock().await;
                if !self.is_accepting() {
                    return Err(SwarmError::ShuttingDown);
                }
                if let Some(handle) = self.runtimes.get(id).await {
                    return Ok(handle);
                }
                tracing::warn!(agent_id = %id, "Active agent without runtime handle, re-registering");
                let handle = self.start_runtime(&record, None).await;
                self.logbook.append(
                    LogbookEntry::new(LogEvent::Reconciled, "runtime handle re-registered").for_agent(&record),
                );
                Ok(handle)
            }
            (None, Some(orphan)) => {
                tracing::warn!(agent_id = %id, "Orphaned runtime handle, removing");
                self.runtimes.remove(id).await;
                orphan.stop(self.settings.stop_grace).await;
                Err(SwarmError::NotFound(id.to_string()))
            }
            (None, None) => Err(SwarmError::NotFound(id.to_string())),
        }
    }

    pub async fn send_message(&self, sender_id: &str, target_id: &str, payload: &str) -> Result<Delivery, SwarmError> {
        let delivery = self.messenger.send(sender_id, target_id, payload).await?;
        if delivery == Delivery::Pending && self.is_accepting() {
            // 目标活跃但没有句柄：重建后它会取走待取消息
            if let Err(e) = self.observe(target_id).await {
                tracing::warn!(target_id, "Runtime rebuild after pending send failed: {}", e);
            }
        }
        Ok(delivery)
    }

    pub fn broadcast(&self, sender_id: &str, topic: &str, payload: &str) -> Result<usize, SwarmError> {
        self.messenger.broadcast(sender_id, topic, payload)
    }

    /// 活跃 Agent 的层级树
    pub fn hierarchy(&self) -> Result<Vec<AgentNode>, SwarmError> {
        Ok(build_hierarchy(self.registry.list_active()?))
    }

    pub fn list_active(&self) -> Result<Vec<AgentRecord>, SwarmError> {
        Ok(self.registry.list_active()?)
    }

    pub fn graveyard(&self) -> Result<Vec<AgentRecord>, SwarmError> {
        Ok(self.registry.list_graveyard()?)
    }

    /// 回收超时的 ephemeral Agent；返回本次终止的 id
    pub async fn sweep(
        &self,
        now: DateTime<Utc>,
        idle_timeout: Duration,
        policy: SweepPolicy,
    ) -> Result<Vec<String>, SwarmError> {
        let timeout = chrono::Duration::from_std(idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut reclaimed = Vec::new();
        for record in self.registry.list_active()? {
            if record.persistence == PersistenceMode::Persistent || record.is_root() {
                continue;
            }
            if record.status == AgentStatus::Working && policy == SweepPolicy::IdleOnly {
                continue;
            }
            if now.signed_duration_since(record.last_active_at) <= timeout {
                continue;
            }
            match self.terminate(&record.id, "timeout").await {
                Ok(true) => reclaimed.push(record.id),
                Ok(false) => {}
                Err(e) => tracing::warn!(agent_id = %record.id, "Sweep terminate failed: {}", e),
            }
        }
        Ok(reclaimed)
    }

    /// 由当前工具目录重新生成所有运行时的系统提示
    pub async fn refresh_prompts(&self) {
        for id in self.runtimes.ids().await {
            if let Some(handle) = self.runtimes.get(&id).await {
                handle.runtime.refresh_system_prompt();
            }
        }
    }

    /// 关闭：停止接受生成，取消所有运行时并等待 worker 退出。记录保持活跃，下次启动对账。
    pub async fn shutdown(&self) -> usize {
        let handles = {
            let _guard = self.lifecycle.lock().await;
            self.accepting.store(false, Ordering::SeqCst);
            self.runtimes.drain().await
        };
        let grace = self.settings.stop_grace;
        join_all(handles.iter().map(|h| h.stop(grace))).await;
        self.logbook.append(LogbookEntry::new(
            LogEvent::Shutdown,
            format!("{} runtimes stopped", handles.len()),
        ));
        tracing::info!(stopped = handles.len(), "Swarm drained");
        handles.len()
    }

    fn publish_spawned(&self, record: &AgentRecord) {
        self.bus.publish(
            Envelope::new(Event::AgentSpawned {
                agent_id: record.id.clone(),
                name: record.name.clone(),
                tier: record.tier,
            })
            .with_agent(record.id.clone()),
        );
    }

    async fn start_runtime(&self, record: &AgentRecord, mission: Option<String>) -> Arc<RuntimeHandle> {
        let runtime = Arc::new(AgentRuntime::new(
            self.deps.clone(),
            AgentIdentity::from_record(record, &self.base_prompt),
        ));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = InboxWorker {
            agent_id: record.id.clone(),
            parent_id: record.parent_id.clone(),
            runtime: Arc::clone(&runtime),
            registry: self.registry.clone(),
            messenger: Arc::clone(&self.messenger),
            cancel: cancel.clone(),
            inbox: rx,
            mission,
        };
        let join = tokio::spawn(worker.run());
        let handle = Arc::new(RuntimeHandle::new(record.id.clone(), runtime, cancel, tx, join));
        if let Some(previous) = self.runtimes.insert(Arc::clone(&handle)).await {
            previous.stop(self.settings.stop_grace).await;
        }
        handle
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Handled {
    Answered(String),
    Failed,
    Cancelled,
}

/// 单个 Agent 的输入消费循环
struct InboxWorker {
    agent_id: String,
    parent_id: Option<String>,
    runtime: Arc<AgentRuntime>,
    registry: AgentRegistry,
    messenger: Arc<SwarmMessenger>,
    cancel: CancellationToken,
    inbox: mpsc::UnboundedReceiver<SwarmMessage>,
    mission: Option<String>,
}

impl InboxWorker {
    fn session_id(&self) -> String {
        format!("swarm:{}", self.agent_id)
    }

    async fn run(mut self) {
        let backlog = match self.messenger.pending_for(&self.agent_id) {
            Ok(backlog) => backlog,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, "Failed to load pending messages: {}", e);
                Vec::new()
            }
        };

        if let Some(mission) = self.mission.take() {
            if let Handled::Answered(text) = self.handle(&mission).await {
                self.report(&text).await;
            }
        }
        // 启动时读到的消息可能同时还在队列里
        let mut seen = HashSet::new();
        for message in backlog {
            if self.cancel.is_cancelled() {
                return;
            }
            self.consume(&message).await;
            seen.insert(message.id);
        }

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.inbox.recv() => message,
            };
            match message {
                Some(message) => {
                    if !seen.remove(&message.id) {
                        self.consume(&message).await;
                    }
                }
                None => break,
            }
        }
        tracing::debug!(agent_id = %self.agent_id, "Inbox worker stopped");
    }

    /// 运行结束后确认；被取消的消息保持待取，由下一个 worker 重新处理
    async fn consume(&self, message: &SwarmMessage) {
        if self.handle(&message.as_input()).await == Handled::Cancelled {
            return;
        }
        if let Err(e) = self.messenger.ack(&message.id) {
            tracing::warn!(agent_id = %self.agent_id, message_id = %message.id, "Message ack failed: {}", e);
        }
    }

    async fn handle(&self, input: &str) -> Handled {
        if let Err(e) = self.registry.update_status(&self.agent_id, AgentStatus::Working) {
            tracing::warn!(agent_id = %self.agent_id, "Status update failed: {}", e);
        }
        let options = RunOptions::default().with_cancel(self.cancel.clone());
        let result = self.runtime.run(input, &self.session_id(), options).await;
        if let Err(e) = self.registry.update_status(&self.agent_id, AgentStatus::Idle) {
            tracing::warn!(agent_id = %self.agent_id, "Status update failed: {}", e);
        }
        match result {
            Ok(outcome) => Handled::Answered(outcome.text),
            Err(AgentError::Cancelled) => Handled::Cancelled,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, kind = %e.kind(), "Agent run failed: {}", e);
                Handled::Failed
            }
        }
    }

    async fn report(&self, text: &str) {
        let Some(parent_id) = &self.parent_id else {
            return;
        };
        let payload = format!("mission report: {}", text);
        if let Err(e) = self.messenger.send(&self.agent_id, parent_id, &payload).await {
            tracing::warn!(agent_id = %self.agent_id, parent_id = %parent_id, "Mission report not delivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StaticGate, TaskScheduler};
    use crate::llm::{BackendSet, MockBackend, ModelCatalog, ModelChains, ModelRouter, RouterConfig, RoutingPolicy};
    use crate::react::{DigestCompactor, RuntimeSettings};
    use crate::swarm::MessageTarget;
    use crate::tools::{ToolCatalog, ToolExecutor, ToolRegistry};

    fn manager(settings: SwarmSettings) -> Arc<SwarmManager> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        manager_on(settings, db, Arc::new(MockBackend::new()))
    }

    fn manager_on(settings: SwarmSettings, db: Arc<Database>, mock: Arc<MockBackend>) -> Arc<SwarmManager> {
        let bus = Arc::new(EventBus::new(64));
        let router = Arc::new(ModelRouter::new(
            RouterConfig::new(ModelCatalog::built_in(), ModelChains::default()).with_default_chain(&["mock"]),
            RoutingPolicy::default().without_backoff(),
            BackendSet::new().with("mock", mock),
            Arc::clone(&bus),
        ));
        let deps = RuntimeDeps {
            router,
            tools: Arc::new(ToolCatalog::new(ToolRegistry::new())),
            executor: Arc::new(ToolExecutor::new(
                Duration::from_secs(5),
                TaskScheduler::default(),
                Arc::new(StaticGate(true)),
            )),
            bus,
            compactor: Arc::new(DigestCompactor),
            logbook: None,
            sessions: None,
            settings: RuntimeSettings::default(),
        };
        let logbook = Logbook::start(Arc::clone(&db));
        SwarmManager::new(settings, db, logbook, deps, "You are part of a swarm.")
    }

    fn quiet() -> SwarmSettings {
        SwarmSettings {
            max_depth: 3,
            run_mission_on_spawn: false,
            stop_grace: Duration::from_millis(200),
            ..SwarmSettings::default()
        }
    }

    #[tokio::test]
    async fn test_boot_is_idempotent() {
        let manager = manager(quiet());
        let first = manager.boot().await.unwrap();
        let second = manager.boot().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(manager.list_active().unwrap().len(), 1);
        assert!(manager.runtimes().contains(&first.id).await);
    }

    #[tokio::test]
    async fn test_spawn_validates_tier_and_depth() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();

        let mut wrong_tier = SpawnRequest::child_of(&root, "scout", "look around");
        wrong_tier.tier = 3;
        let err = manager.spawn(wrong_tier).await.unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTier { tier: 3, expected: 2 }));

        let child = manager
            .spawn(SpawnRequest::child_of(&root, "scout", "look around"))
            .await
            .unwrap()
            .record;
        let grandchild = manager
            .spawn(SpawnRequest::child_of(&child, "digger", "dig"))
            .await
            .unwrap()
            .record;
        let err = manager
            .spawn(SpawnRequest::child_of(&grandchild, "too-deep", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::DepthExceeded { tier: 4, max_depth: 3 }));

        // 失败的请求不留下记录
        assert_eq!(manager.list_active().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_spawn_with_unknown_parent_is_rejected() {
        let manager = manager(quiet());
        manager.boot().await.unwrap();
        let request = SpawnRequest {
            name: "lost".into(),
            tier: 2,
            parent_id: Some("ghost".into()),
            mission: String::new(),
            model_role: None,
            persistence: PersistenceMode::Ephemeral,
        };
        assert!(matches!(
            manager.spawn(request).await.unwrap_err(),
            SwarmError::ParentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_root_spawns_yield_single_root() {
        let manager = manager(quiet());
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .spawn(SpawnRequest {
                            name: "queen".into(),
                            tier: ROOT_TIER,
                            parent_id: None,
                            mission: String::new(),
                            model_role: None,
                            persistence: PersistenceMode::Persistent,
                        })
                        .await
                        .unwrap()
                        .record
                        .id
                })
            })
            .collect();
        let ids: Vec<String> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();
        assert!(ids.iter().all(|id| id == &ids[0]));
        let roots: Vec<_> = manager
            .list_active()
            .unwrap()
            .into_iter()
            .filter(|r| r.tier == ROOT_TIER)
            .collect();
        assert_eq!(roots.len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_twice_keeps_original_reason() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();
        let child = manager
            .spawn(SpawnRequest::child_of(&root, "scout", ""))
            .await
            .unwrap()
            .record;

        assert!(manager.terminate(&child.id, "requested").await.unwrap());
        assert!(!manager.terminate(&child.id, "timeout").await.unwrap());
        assert!(!manager.runtimes().contains(&child.id).await);

        let graveyard = manager.graveyard().unwrap();
        assert_eq!(graveyard.len(), 1);
        assert_eq!(graveyard[0].termination_reason.as_deref(), Some("requested"));
    }

    #[tokio::test]
    async fn test_root_cannot_be_terminated() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();
        assert!(matches!(
            manager.terminate(&root.id, "requested").await.unwrap_err(),
            SwarmError::RootProtected(_)
        ));
    }

    #[tokio::test]
    async fn test_observe_rebuilds_missing_handle() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();
        let child = manager
            .spawn(SpawnRequest::child_of(&root, "scout", ""))
            .await
            .unwrap()
            .record;

        let lost = manager.runtimes().remove(&child.id).await.unwrap();
        lost.stop(Duration::from_millis(50)).await;
        manager.observe(&child.id).await.unwrap();
        assert!(manager.runtimes().contains(&child.id).await);
    }

    #[tokio::test]
    async fn test_mission_report_reaches_parent() {
        let settings = SwarmSettings {
            run_mission_on_spawn: true,
            ..quiet()
        };
        let manager = manager(settings);
        let root = manager.boot().await.unwrap();
        // 根的 worker 停掉，让汇报保持待取状态以便检查
        manager.runtimes().remove(&root.id).await.unwrap().stop(Duration::from_millis(50)).await;

        manager
            .spawn(SpawnRequest::child_of(&root, "scout", "count the bees"))
            .await
            .unwrap();

        let mut reports = Vec::new();
        for _ in 0..50 {
            reports = manager.registry().database().pending_messages(&root.id).unwrap();
            if !reports.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(reports.len(), 1);
        assert!(reports[0].payload.contains("Echo from Mock: count the bees"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_spawns() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();
        manager.spawn(SpawnRequest::child_of(&root, "scout", "")).await.unwrap();

        assert_eq!(manager.shutdown().await, 2);
        assert!(matches!(
            manager.spawn(SpawnRequest::child_of(&root, "late", "")).await.unwrap_err(),
            SwarmError::ShuttingDown
        ));
        // 记录保持活跃，下次启动对账
        assert_eq!(manager.list_active().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unprocessed_messages_survive_restart() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let slow = Arc::new(MockBackend::new().with_latency(Duration::from_millis(500)));
        let first_life = manager_on(quiet(), Arc::clone(&db), slow);
        let root = first_life.boot().await.unwrap();
        let child = first_life
            .spawn(SpawnRequest::child_of(&root, "scout", ""))
            .await
            .unwrap()
            .record;

        assert_eq!(
            first_life.send_message(&root.id, &child.id, "first").await.unwrap(),
            Delivery::Delivered
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            first_life.send_message(&root.id, &child.id, "second").await.unwrap(),
            Delivery::Delivered
        );
        first_life.shutdown().await;

        let pending: Vec<String> = db
            .pending_messages(&child.id)
            .unwrap()
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(pending, vec!["first", "second"]);

        let fast = Arc::new(MockBackend::new());
        let second_life = manager_on(quiet(), Arc::clone(&db), Arc::clone(&fast));
        second_life.boot().await.unwrap();
        for _ in 0..50 {
            if db.pending_messages(&child.id).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(db.pending_messages(&child.id).unwrap().is_empty());
        assert_eq!(fast.total_attempts(), 2);
    }

    #[tokio::test]
    async fn test_processed_message_is_acked_once() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();
        let child = manager
            .spawn(SpawnRequest::child_of(&root, "scout", ""))
            .await
            .unwrap()
            .record;
        manager.send_message(&root.id, &child.id, "ping").await.unwrap();

        let db = manager.registry().database();
        for _ in 0..50 {
            if db.pending_messages(&child.id).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let all = db.messages_for(&MessageTarget::Agent(child.id.clone())).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].delivered);
    }

    #[tokio::test]
    async fn test_pending_send_rebuilds_handle_and_drains() {
        let manager = manager(quiet());
        let root = manager.boot().await.unwrap();
        let child = manager
            .spawn(SpawnRequest::child_of(&root, "scout", ""))
            .await
            .unwrap()
            .record;
        manager
            .runtimes()
            .remove(&child.id)
            .await
            .unwrap()
            .stop(Duration::from_millis(50))
            .await;

        let delivery = manager.send_message(&root.id, &child.id, "wake up").await.unwrap();
        assert_eq!(delivery, Delivery::Pending);
        assert!(manager.runtimes().contains(&child.id).await);

        let db = manager.registry().database();
        for _ in 0..50 {
            if db.pending_messages(&child.id).unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(db.pending_messages(&child.id).unwrap().is_empty());
    }
}
