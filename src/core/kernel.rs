//! 内核装配：启动时构造一次依赖结构，再按引用交给各组件
//!
//! 启动顺序：数据库 / Logbook -> 路由器（探测）-> 工具目录 -> 蜂群（根 + 对账）-> 会话恢复。
//! 关闭顺序：停止接收 spawn -> 取消运行并等待 worker -> 取消挂起的审批 -> Logbook 落盘。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{
    AgentError, ApprovalManager, EventBus, LogbookFlush, ShutdownManager, ShutdownReason,
    ShutdownSequence, SwarmDrain, TaskScheduler,
};
use crate::llm::{BackendSet, CatalogError, ModelChains, ModelRouter, RouterError, RouterStatus};
use crate::memory::SessionStore;
use crate::react::{
    Compactor, DigestCompactor, ModelCompactor, RunOptions, RunOutcome, RuntimeDeps,
};
use crate::swarm::{AgentRecord, Database, Logbook, SwarmManager, SwarmSweeper};
use crate::tools::{register_swarm_tools, EchoTool, ToolCatalog, ToolExecutor, ToolRegistry};

/// 一次用户提交的选项（对应 inbound message 帧）
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub model_role: Option<String>,
    pub model_id: Option<String>,
}

/// 可注入的存储（测试用内存数据库 / 临时目录）
pub struct KernelStorage {
    pub db: Arc<Database>,
    pub sessions: Option<Arc<SessionStore>>,
}

impl KernelStorage {
    /// 按配置的数据目录打开：hive.db + sessions/
    pub fn open(config: &AppConfig) -> anyhow::Result<Self> {
        let dir = config.data_dir();
        std::fs::create_dir_all(&dir)?;
        let db = Database::open(dir.join("hive.db"))?;
        Ok(Self {
            db: Arc::new(db),
            sessions: Some(Arc::new(SessionStore::new(
                dir.join("sessions"),
                config.app.session_keep_messages,
            ))),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            db: Arc::new(Database::open_in_memory()?),
            sessions: None,
        })
    }
}

pub struct Kernel {
    config: RwLock<AppConfig>,
    bus: Arc<EventBus>,
    router: Arc<ModelRouter>,
    router_status: RouterStatus,
    approvals: Arc<ApprovalManager>,
    tools: Arc<ToolCatalog>,
    swarm: Arc<SwarmManager>,
    logbook: Arc<Logbook>,
    sessions: Option<Arc<SessionStore>>,
    root: AgentRecord,
    shutdown: Arc<ShutdownManager>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    /// 按配置启动（数据目录中的 SQLite 与会话文件）
    pub async fn boot(config: AppConfig, backends: BackendSet) -> anyhow::Result<Arc<Self>> {
        let storage = KernelStorage::open(&config)?;
        Self::boot_with(config, backends, storage).await
    }

    pub async fn boot_with(
        config: AppConfig,
        backends: BackendSet,
        storage: KernelStorage,
    ) -> anyhow::Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new(config.runtime.event_capacity));
        let logbook = Logbook::start(Arc::clone(&storage.db));

        let router = Arc::new(ModelRouter::new(
            config.router.router_config()?,
            config.router.routing.clone(),
            backends,
            Arc::clone(&bus),
        ));
        let router_status = router.initialize().await;

        let approvals = Arc::new(ApprovalManager::new(
            config.approval.policy,
            Duration::from_secs(config.approval.timeout_secs.max(1)),
            Arc::clone(&bus),
        ));
        let scheduler = TaskScheduler::new(config.runtime.tool_fanout);
        let executor = Arc::new(ToolExecutor::new(
            Duration::from_secs(config.runtime.tool_timeout_secs.max(1)),
            scheduler,
            approvals.clone(),
        ));
        let tools = Arc::new(ToolCatalog::new(ToolRegistry::new().with(EchoTool)));

        let compactor: Arc<dyn Compactor> = match &config.router.summarize_role {
            Some(role) => Arc::new(ModelCompactor::new(Arc::clone(&router), Some(role.clone()))),
            None => Arc::new(DigestCompactor),
        };
        let deps = RuntimeDeps {
            router: Arc::clone(&router),
            tools: Arc::clone(&tools),
            executor,
            bus: Arc::clone(&bus),
            compactor,
            logbook: Some(Arc::clone(&logbook)),
            sessions: storage.sessions.clone(),
            settings: config.runtime.settings(),
        };

        let swarm = SwarmManager::new(
            config.swarm.settings(),
            Arc::clone(&storage.db),
            Arc::clone(&logbook),
            deps,
            config.base_prompt(),
        );
        // 工具先于运行时注册，系统提示里才会列出它们
        tools.update(|registry| register_swarm_tools(registry, &swarm));
        let root = swarm.boot().await?;

        let kernel = Arc::new(Self {
            config: RwLock::new(config),
            bus,
            router,
            router_status,
            approvals,
            tools,
            swarm,
            logbook,
            sessions: storage.sessions,
            root,
            shutdown: Arc::new(ShutdownManager::new()),
            sweeper: Mutex::new(None),
        });
        kernel.restore_sessions().await;
        tracing::info!(root_id = %kernel.root.id, "Kernel booted");
        Ok(kernel)
    }

    async fn restore_sessions(&self) {
        let Some(store) = &self.sessions else {
            return;
        };
        let Ok(root) = self.swarm.root().await else {
            return;
        };
        let mut restored = 0;
        for (session_id, messages) in store.load_all() {
            if root.runtime.seed_context(&session_id, messages).await {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "Sessions restored");
        }
    }

    pub fn config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn router_status(&self) -> &RouterStatus {
        &self.router_status
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }

    pub fn tools(&self) -> &Arc<ToolCatalog> {
        &self.tools
    }

    pub fn swarm(&self) -> &Arc<SwarmManager> {
        &self.swarm
    }

    pub fn logbook(&self) -> &Arc<Logbook> {
        &self.logbook
    }

    pub fn root(&self) -> &AgentRecord {
        &self.root
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 把用户输入交给根 Agent
    pub async fn submit(
        &self,
        session_id: &str,
        input: &str,
        options: SubmitOptions,
    ) -> Result<RunOutcome, AgentError> {
        let root = self
            .swarm
            .root()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        let mut run = RunOptions::default().with_cancel(self.shutdown.token().child_token());
        run.model_role = options.model_role;
        run.model_id = options.model_id;
        root.runtime.run(input, session_id, run).await
    }

    /// 丢弃某个会话的上下文
    pub async fn reset_session(&self, session_id: &str) -> bool {
        match self.swarm.root().await {
            Ok(root) => root.runtime.reset_context(session_id).await,
            Err(_) => false,
        }
    }

    /// 热更新：发布新的目录 / 角色链 / 路由策略，下一个迭代边界生效
    pub fn reload(&self, config: AppConfig) -> Result<(), RouterError> {
        let catalog = config.router.catalog()?;
        self.router.update_catalog(move |c| {
            *c = catalog;
            Ok::<(), CatalogError>(())
        })?;
        self.router
            .update_chains(ModelChains::from_map(config.router.chains.clone()));
        self.router.update_overrides(
            config.router.task_overrides.clone(),
            config.router.default_chain.clone(),
        );
        self.router.update_routing(config.router.routing.clone());
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// 启动后台回收任务（重复调用无效）
    pub async fn spawn_sweeper(&self) {
        let mut slot = self.sweeper.lock().await;
        if slot.is_some() {
            return;
        }
        let config = self.config();
        let sweeper = SwarmSweeper::new(
            Arc::clone(&self.swarm),
            Duration::from_secs(config.swarm.sweep_interval_secs.max(1)),
            Duration::from_secs(config.swarm.idle_timeout_secs),
            config.swarm.sweep_policy,
        );
        *slot = Some(sweeper.spawn(self.shutdown.token().child_token()));
    }

    /// 优雅关闭（幂等）
    pub async fn shutdown(&self) {
        self.shutdown.shutdown(ShutdownReason::Requested);
        self.approvals.cancel_all();

        let report = ShutdownSequence::new(self.swarm.settings().stop_grace + Duration::from_secs(5))
            .then(SwarmDrain::new(Arc::clone(&self.swarm)))
            .then(LogbookFlush::new(Arc::clone(&self.logbook)))
            .run()
            .await;
        if !report.is_clean() {
            tracing::warn!(?report, "Shutdown finished with problems");
        }

        if let Some(sweeper) = self.sweeper.lock().await.take() {
            let _ = sweeper.await;
        }
    }
}
