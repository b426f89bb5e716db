//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SWARM__MAX_DEPTH=3`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::ApprovalPolicy;
use crate::llm::{CatalogError, ModelCatalog, ModelChains, ModelEntry, Provenance, RouterConfig, RoutingPolicy};
use crate::react::RuntimeSettings;
use crate::swarm::{SweepPolicy, SwarmSettings};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub router: RouterSection,
    pub runtime: RuntimeSection,
    pub swarm: SwarmSection,
    pub approval: ApprovalSection,
    pub gateway: GatewaySection,
}

/// [app] 段：应用名、数据目录、基础系统提示
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// SQLite 与会话文件所在目录，未设置时用 ./data
    pub data_dir: Option<PathBuf>,
    pub system_prompt: Option<String>,
    /// 每个会话持久化的最近消息数
    pub session_keep_messages: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            data_dir: None,
            system_prompt: None,
            session_keep_messages: 60,
        }
    }
}

/// [[router.models]]：用户配置的模型条目
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    pub id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 发给后端的模型名，缺省等于 id
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

/// [router] 段：模型目录、角色链、任务覆盖与路由策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 代理层地址：填充未设置 base_url 的条目
    pub proxy_base_url: Option<String>,
    /// OpenAI 兼容后端的默认地址与密钥
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub models: Vec<ModelSection>,
    pub chains: HashMap<String, Vec<String>>,
    pub task_overrides: HashMap<String, Vec<String>>,
    pub default_chain: Vec<String>,
    pub routing: RoutingPolicy,
    /// 压缩摘要使用的角色；未设置时逐条摘录，不调用模型
    pub summarize_role: Option<String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            proxy_base_url: None,
            base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            models: Vec::new(),
            chains: HashMap::new(),
            task_overrides: HashMap::new(),
            default_chain: Vec::new(),
            routing: RoutingPolicy::default(),
            summarize_role: None,
        }
    }
}

impl RouterSection {
    /// 内置目录 + 用户条目；与内置 id 重复时只更新连接信息
    pub fn catalog(&self) -> Result<ModelCatalog, CatalogError> {
        let mut catalog = ModelCatalog::built_in();
        for model in &self.models {
            let mut entry = ModelEntry::new(
                &model.id,
                &model.provider,
                model.model.clone().unwrap_or_else(|| model.id.clone()),
                Provenance::UserAdded,
            );
            entry.base_url = model.base_url.clone();
            entry.api_key = model.api_key.clone();
            if catalog.contains(&entry.id) {
                catalog.edit_connection(&entry.id, entry.base_url, entry.api_key)?;
            } else {
                catalog.add(entry)?;
            }
        }
        Ok(catalog)
    }

    pub fn router_config(&self) -> Result<RouterConfig, CatalogError> {
        let mut config = RouterConfig::new(self.catalog()?, ModelChains::from_map(self.chains.clone()));
        config.task_overrides = self.task_overrides.clone();
        config.default_chain = self.default_chain.clone();
        config.proxy_base_url = self.proxy_base_url.clone();
        Ok(config)
    }

    /// 配置中的密钥，缺省读 OPENAI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// [runtime] 段：推理循环参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_iterations: usize,
    /// 同一轮内并发执行的工具调用上限
    pub tool_fanout: usize,
    pub context_soft_limit_chars: usize,
    pub keep_recent_turns: usize,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 事件总线每个订阅者的缓冲
    pub event_capacity: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let settings = RuntimeSettings::default();
        Self {
            max_iterations: settings.max_iterations,
            tool_fanout: 3,
            context_soft_limit_chars: settings.context_soft_limit_chars,
            keep_recent_turns: settings.keep_recent_turns,
            tool_timeout_secs: 30,
            event_capacity: 256,
        }
    }
}

impl RuntimeSection {
    pub fn settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            max_iterations: self.max_iterations.max(1),
            context_soft_limit_chars: self.context_soft_limit_chars,
            keep_recent_turns: self.keep_recent_turns.max(1),
        }
    }
}

/// [swarm] 段：层级深度、根 Agent、回收策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    pub max_depth: u32,
    pub root_name: String,
    pub root_mission: String,
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub sweep_policy: SweepPolicy,
    pub stop_grace_secs: u64,
    pub run_mission_on_spawn: bool,
}

impl Default for SwarmSection {
    fn default() -> Self {
        let settings = SwarmSettings::default();
        Self {
            max_depth: settings.max_depth,
            root_name: settings.root_name,
            root_mission: settings.root_mission,
            sweep_interval_secs: 60,
            idle_timeout_secs: 600,
            sweep_policy: SweepPolicy::IdleOnly,
            stop_grace_secs: settings.stop_grace.as_secs(),
            run_mission_on_spawn: settings.run_mission_on_spawn,
        }
    }
}

impl SwarmSection {
    pub fn settings(&self) -> SwarmSettings {
        SwarmSettings {
            max_depth: self.max_depth.max(1),
            root_name: self.root_name.clone(),
            root_mission: self.root_mission.clone(),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            run_mission_on_spawn: self.run_mission_on_spawn,
        }
    }
}

/// [approval] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    pub timeout_secs: u64,
    pub policy: ApprovalPolicy,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            policy: ApprovalPolicy::Ask,
        }
    }
}

/// [gateway] 段：WebSocket 监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bind: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8766".to_string(),
        }
    }
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.app
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    pub fn base_prompt(&self) -> String {
        self.app.system_prompt.clone().unwrap_or_else(|| {
            "You are an agent in a hive of cooperating agents. Use tools when they help; answer directly otherwise."
                .to_string()
        })
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 只从一个文件加载（不叠加默认文件与环境变量）
pub fn load_config_file(path: &std::path::Path) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .build()?
        .try_deserialize()
}
