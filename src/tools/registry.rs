//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! ToolCatalog 持有当前注册表快照：替换整张表即发布，运行中的迭代继续使用它开始时拿到的快照。

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;

/// 一次工具调用的上下文：调用方会话与 Agent
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
    /// 发起调用的 Agent id（根 Agent / 蜂群成员）
    pub agent_id: Option<String>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, agent_id: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型调用时使用）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行前是否需要人工审批
    fn requires_approval(&self) -> bool {
        false
    }

    /// 执行工具
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| {
                self.tools
                    .get(&name)
                    .map(|t| (name.clone(), t.description().to_string()))
            })
            .collect()
    }

    /// 暴露给模型的工具描述（按名称排序，保证请求稳定）
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| self.tools.get(&name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

/// 可热替换的工具目录
pub struct ToolCatalog {
    current: ArcSwap<ToolRegistry>,
}

impl ToolCatalog {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            current: ArcSwap::from_pointee(registry),
        }
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<ToolRegistry> {
        self.current.load_full()
    }

    /// 整表替换
    pub fn publish(&self, registry: ToolRegistry) {
        let count = registry.len();
        self.current.store(Arc::new(registry));
        tracing::info!(tools = count, "Tool catalog published");
    }

    /// 基于当前快照修改后发布
    pub fn update(&self, edit: impl FnOnce(&mut ToolRegistry)) {
        let mut next = (*self.snapshot()).clone();
        edit(&mut next);
        self.publish(next);
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new(ToolRegistry::new())
    }
}
