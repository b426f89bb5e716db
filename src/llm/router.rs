//! 模型路由器：候选解析 + 重试 / 回退
//!
//! 解析顺序：显式模型 id > 任务覆盖 > 角色链 > 默认链（配置 > 内置）。
//! complete 按候选顺序尝试：暂时性错误在同一候选内重试；限流 / 致命错误按策略切换候选；
//! 全部失败时发布一次 critical_failure 通知（最多携带前 3 条错误）并返回 Exhausted。
//!
//! 配置与策略通过 ArcSwap 发布：读取无锁，进行中的调用持有自己的快照，不受更新影响。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

use crate::core::{Envelope, Event, EventBus};
use crate::llm::{
    dedup_ids, BackendError, BackendErrorKind, CatalogError, CompletionRequest, ModelBackend,
    ModelCatalog, ModelChains, ModelEntry, ModelResponse, RoutingPolicy,
};

/// 内置默认链（配置未提供 default_chain 时使用）
pub const BUILT_IN_DEFAULT_CHAIN: &[&str] = &["gpt-4o-mini"];

/// 临界失败通知中携带的错误条数上限
const NOTIFY_ERROR_LIMIT: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// 所有回退之后仍没有候选
    #[error("No model candidates for '{0}'")]
    Resolution(String),

    /// 所有候选均失败（critical failure）
    #[error("All model candidates failed for '{label}': {}", .errors.join("; "))]
    Exhausted { label: String, errors: Vec<String> },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// 路由配置快照：目录 + 角色链 + 任务覆盖 + 默认链
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterConfig {
    pub catalog: ModelCatalog,
    pub chains: ModelChains,
    pub task_overrides: HashMap<String, Vec<String>>,
    pub default_chain: Vec<String>,
    /// 代理层地址：未配置 base_url 的条目经由该代理访问
    pub proxy_base_url: Option<String>,
}

impl RouterConfig {
    pub fn new(catalog: ModelCatalog, chains: ModelChains) -> Self {
        Self {
            catalog,
            chains,
            ..Self::default()
        }
    }

    pub fn with_task_override(mut self, task: impl Into<String>, ids: &[&str]) -> Self {
        self.task_overrides
            .insert(task.into(), ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_default_chain(mut self, ids: &[&str]) -> Self {
        self.default_chain = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn default_ids(&self) -> Vec<String> {
        if self.default_chain.is_empty() {
            BUILT_IN_DEFAULT_CHAIN.iter().map(|s| s.to_string()).collect()
        } else {
            self.default_chain.clone()
        }
    }

    /// 纯函数：把「角色或模型 id」+ 任务名解析为有序去重的候选列表
    pub fn resolve_candidates(
        &self,
        role_or_model_id: Option<&str>,
        task_name: Option<&str>,
    ) -> Result<Vec<ModelEntry>, RouterError> {
        let requested = role_or_model_id.filter(|s| !s.is_empty());

        let ids: Vec<String> = if let Some(id) = requested.filter(|id| self.catalog.contains(id)) {
            vec![id.to_string()]
        } else if let Some(ids) = task_name
            .and_then(|t| self.task_overrides.get(t))
            .filter(|ids| !ids.is_empty())
        {
            ids.clone()
        } else if let Some(ids) = requested.and_then(|role| self.chains.get(role)) {
            ids.to_vec()
        } else {
            self.default_ids()
        };

        let candidates: Vec<ModelEntry> = dedup_ids(ids)
            .into_iter()
            .filter_map(|id| match self.catalog.get(&id) {
                Some(entry) => Some(self.with_proxy(entry.clone())),
                None => {
                    tracing::warn!(model_id = %id, "Chain references unknown model, skipping");
                    None
                }
            })
            .collect();

        if candidates.is_empty() {
            let label = task_name.or(requested).unwrap_or("default");
            return Err(RouterError::Resolution(label.to_string()));
        }
        Ok(candidates)
    }

    fn with_proxy(&self, mut entry: ModelEntry) -> ModelEntry {
        if entry.base_url.is_none() {
            entry.base_url = self.proxy_base_url.clone();
        }
        entry
    }
}

/// provider -> 后端实现
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl Into<String>, backend: Arc<dyn ModelBackend>) -> Self {
        self.insert(provider, backend);
        self
    }

    pub fn insert(&mut self, provider: impl Into<String>, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(provider.into(), backend);
    }

    pub fn get(&self, provider: &str) -> Option<&Arc<dyn ModelBackend>> {
        self.backends.get(provider)
    }

    pub fn providers(&self) -> Vec<String> {
        let mut p: Vec<String> = self.backends.keys().cloned().collect();
        p.sort();
        p
    }
}

/// 访问模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    /// 经由代理层
    Proxy,
    /// 直连后端
    Direct,
}

/// initialize 的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStatus {
    pub mode: RouterMode,
    pub reachable: Vec<String>,
    pub unreachable: Vec<String>,
}

/// 成功调用的结果
#[derive(Debug, Clone)]
pub struct RouterResponse {
    pub response: ModelResponse,
    pub model_id: String,
    /// 本次调用的总尝试次数（跨候选）
    pub attempts: u32,
}

/// 单次失败后的下一步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Retry,
    NextCandidate,
    Abort,
}

fn next_step(policy: &RoutingPolicy, err: &BackendError, can_retry: bool) -> NextStep {
    match err.kind {
        BackendErrorKind::RateLimited => {
            if policy.fallback_on_rate_limit {
                NextStep::NextCandidate
            } else if can_retry {
                NextStep::Retry
            } else {
                NextStep::Abort
            }
        }
        BackendErrorKind::ServerError | BackendErrorKind::Transport => {
            if can_retry {
                NextStep::Retry
            } else if policy.fallback_on_error {
                NextStep::NextCandidate
            } else {
                NextStep::Abort
            }
        }
        BackendErrorKind::Invalid => {
            if policy.fallback_on_error {
                NextStep::NextCandidate
            } else {
                NextStep::Abort
            }
        }
    }
}

/// 模型路由器
pub struct ModelRouter {
    config: ArcSwap<RouterConfig>,
    policy: ArcSwap<RoutingPolicy>,
    /// 写者串行化；读者不加锁
    write_lock: Mutex<()>,
    backends: BackendSet,
    bus: Arc<EventBus>,
    /// 累计后端调用次数
    call_count: AtomicU64,
}

impl ModelRouter {
    pub fn new(
        config: RouterConfig,
        policy: RoutingPolicy,
        backends: BackendSet,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            policy: ArcSwap::from_pointee(policy),
            write_lock: Mutex::new(()),
            backends,
            bus,
            call_count: AtomicU64::new(0),
        }
    }

    /// 启动时探测：模式（代理 / 直连）与各模型可达性
    pub async fn initialize(&self) -> RouterStatus {
        let config = self.config();
        let mode = if config.proxy_base_url.is_some() {
            RouterMode::Proxy
        } else {
            RouterMode::Direct
        };

        let mut reachable = Vec::new();
        let mut unreachable = Vec::new();
        for entry in config.catalog.entries() {
            let entry = config.with_proxy(entry.clone());
            let Some(backend) = self.backends.get(&entry.provider) else {
                unreachable.push(entry.id.clone());
                continue;
            };
            match backend.probe(&entry).await {
                Ok(()) => reachable.push(entry.id.clone()),
                Err(e) => {
                    tracing::warn!(model_id = %entry.id, "Model probe failed: {}", e);
                    unreachable.push(entry.id.clone());
                }
            }
        }

        tracing::info!(
            ?mode,
            reachable = reachable.len(),
            unreachable = unreachable.len(),
            "Model router initialized"
        );
        RouterStatus {
            mode,
            reachable,
            unreachable,
        }
    }

    /// 当前配置快照
    pub fn config(&self) -> Arc<RouterConfig> {
        self.config.load_full()
    }

    /// 当前策略快照
    pub fn policy(&self) -> Arc<RoutingPolicy> {
        self.policy.load_full()
    }

    pub fn resolve_candidates(
        &self,
        role_or_model_id: Option<&str>,
        task_name: Option<&str>,
    ) -> Result<Vec<ModelEntry>, RouterError> {
        self.config().resolve_candidates(role_or_model_id, task_name)
    }

    fn publish_config(&self, edit: impl FnOnce(&mut RouterConfig) -> Result<(), RouterError>) -> Result<(), RouterError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = (*self.config.load_full()).clone();
        edit(&mut next)?;
        self.config.store(Arc::new(next));
        Ok(())
    }

    /// 替换角色链
    pub fn update_chains(&self, chains: ModelChains) {
        let _ = self.publish_config(|c| {
            c.chains = chains;
            Ok(())
        });
        tracing::info!("Model chains updated");
    }

    /// 校验后替换角色链；校验与发布在同一把写锁内，不会与目录删除交错
    pub fn set_chains(&self, chains: ModelChains) -> Result<(), RouterError> {
        self.publish_config(|c| {
            if let Some(unknown) = chains.model_ids().find(|id| !c.catalog.contains(id)) {
                return Err(CatalogError::NotFound(unknown.to_string()).into());
            }
            c.chains = chains;
            Ok(())
        })?;
        tracing::info!("Model chains updated");
        Ok(())
    }

    /// 替换任务覆盖与默认链
    pub fn update_overrides(&self, task_overrides: HashMap<String, Vec<String>>, default_chain: Vec<String>) {
        let _ = self.publish_config(|c| {
            c.task_overrides = task_overrides;
            c.default_chain = dedup_ids(default_chain);
            Ok(())
        });
    }

    /// 修改模型目录（新增 / 改凭据 / 删除），成功后发布
    pub fn update_catalog(
        &self,
        edit: impl FnOnce(&mut ModelCatalog) -> Result<(), CatalogError>,
    ) -> Result<(), RouterError> {
        self.publish_config(|c| edit(&mut c.catalog).map_err(RouterError::from))
    }

    /// 替换路由策略
    pub fn update_routing(&self, policy: RoutingPolicy) {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.policy.store(Arc::new(policy));
        tracing::info!("Routing policy updated");
    }

    /// 解析 + 完成（使用当前快照）
    pub async fn route(
        &self,
        role_or_model_id: Option<&str>,
        task_name: Option<&str>,
        request: &CompletionRequest,
    ) -> Result<RouterResponse, RouterError> {
        let policy = self.policy();
        let candidates = self.resolve_candidates(role_or_model_id, task_name)?;
        let label = task_name.or(role_or_model_id).unwrap_or("default");
        self.complete(&policy, label, &candidates, request).await
    }

    /// 按候选顺序尝试，直到成功或全部耗尽
    pub async fn complete(
        &self,
        policy: &RoutingPolicy,
        label: &str,
        candidates: &[ModelEntry],
        request: &CompletionRequest,
    ) -> Result<RouterResponse, RouterError> {
        let per_candidate = policy.attempts_per_candidate();
        let mut errors: Vec<String> = Vec::new();
        let mut total = 0u32;

        'candidates: for entry in candidates {
            let Some(backend) = self.backends.get(&entry.provider) else {
                errors.push(format!("{}: no backend for provider '{}'", entry.id, entry.provider));
                continue;
            };

            let mut attempt = 0u32;
            while attempt < per_candidate {
                if attempt > 0 {
                    let delay = policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                attempt += 1;
                total += 1;
                self.call_count.fetch_add(1, Ordering::Relaxed);

                match backend.complete(entry, request).await {
                    Ok(response) => {
                        if total > 1 {
                            tracing::info!(label, model_id = %entry.id, attempts = total, "Model call recovered");
                        }
                        return Ok(RouterResponse {
                            response,
                            model_id: entry.id.clone(),
                            attempts: total,
                        });
                    }
                    Err(e) => {
                        tracing::debug!(label, model_id = %entry.id, attempt, "Model call failed: {}", e);
                        errors.push(format!("{}: {}", entry.id, e));
                        match next_step(policy, &e, attempt < per_candidate) {
                            NextStep::Retry => continue,
                            NextStep::NextCandidate => {
                                tracing::warn!(label, model_id = %entry.id, "Falling back to next candidate ({})", e.kind);
                                continue 'candidates;
                            }
                            NextStep::Abort => break 'candidates,
                        }
                    }
                }
            }
        }

        Err(self.critical_failure(label, errors))
    }

    fn critical_failure(&self, label: &str, errors: Vec<String>) -> RouterError {
        let head: Vec<String> = errors.iter().take(NOTIFY_ERROR_LIMIT).cloned().collect();
        tracing::error!(label, errors = ?head, "Critical failure: all model candidates exhausted");
        self.bus.publish(Envelope::new(Event::CriticalFailure {
            label: label.to_string(),
            errors: head,
        }));
        RouterError::Exhausted {
            label: label.to_string(),
            errors,
        }
    }

    /// 累计后端调用次数
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockBackend, Provenance};
    use crate::memory::Message;

    fn catalog() -> ModelCatalog {
        let mut c = ModelCatalog::new();
        for id in ["A", "B", "C", "D"] {
            c.add(ModelEntry::new(id, "mock", id, Provenance::UserAdded)).unwrap();
        }
        c
    }

    fn router_with(
        backend: Arc<MockBackend>,
        chains: ModelChains,
        policy: RoutingPolicy,
    ) -> (ModelRouter, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(32));
        let config = RouterConfig::new(catalog(), chains).with_default_chain(&["D"]);
        let router = ModelRouter::new(
            config,
            policy.without_backoff(),
            BackendSet::new().with("mock", backend),
            Arc::clone(&bus),
        );
        (router, bus)
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![],
        }
    }

    #[test]
    fn test_resolve_chain_order_without_duplicates() {
        let config = RouterConfig::new(catalog(), ModelChains::new().with("fast", &["B", "A", "B"]));
        let ids: Vec<String> = config
            .resolve_candidates(Some("fast"), None)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["B", "A"]);
    }

    #[test]
    fn test_resolve_precedence() {
        let config = RouterConfig::new(catalog(), ModelChains::new().with("fast", &["A", "B"]))
            .with_task_override("summarize", &["C"])
            .with_default_chain(&["D"]);

        let explicit = config.resolve_candidates(Some("B"), Some("summarize")).unwrap();
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].id, "B");

        let task = config.resolve_candidates(Some("fast"), Some("summarize")).unwrap();
        assert_eq!(task[0].id, "C");

        let role = config.resolve_candidates(Some("fast"), Some("unknown-task")).unwrap();
        assert_eq!(role[0].id, "A");

        let fallback = config.resolve_candidates(Some("thinking"), None).unwrap();
        assert_eq!(fallback[0].id, "D");
    }

    #[test]
    fn test_empty_chain_uses_built_in_default() {
        let config = RouterConfig::new(ModelCatalog::built_in(), ModelChains::new().with("fast", &[]));
        let ids: Vec<String> = config
            .resolve_candidates(Some("fast"), None)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, BUILT_IN_DEFAULT_CHAIN.to_vec());
    }

    #[test]
    fn test_resolution_error_when_nothing_resolves() {
        let config = RouterConfig::new(ModelCatalog::new(), ModelChains::new());
        assert!(matches!(
            config.resolve_candidates(Some("fast"), None),
            Err(RouterError::Resolution(_))
        ));
    }

    #[test]
    fn test_proxy_fills_missing_base_url() {
        let mut config = RouterConfig::new(catalog(), ModelChains::new());
        config.proxy_base_url = Some("http://proxy:4000".into());
        let c = config.resolve_candidates(Some("A"), None).unwrap();
        assert_eq!(c[0].base_url.as_deref(), Some("http://proxy:4000"));
    }

    #[tokio::test]
    async fn test_rate_limited_falls_back_to_next_candidate() {
        let backend = Arc::new(MockBackend::new());
        backend.push("A", Err(BackendError::rate_limited("429")));
        backend.push("B", Ok(ModelResponse::text("from B")));
        let policy = RoutingPolicy {
            max_retries: 1,
            fallback_on_rate_limit: true,
            ..RoutingPolicy::default()
        };
        let (router, _) = router_with(
            Arc::clone(&backend),
            ModelChains::new().with("fast", &["A", "B"]),
            policy,
        );

        let result = router.route(Some("fast"), None, &request()).await.unwrap();
        assert_eq!(result.response.content, "from B");
        assert_eq!(result.model_id, "B");
        assert_eq!(result.attempts, 2);
        assert_eq!(backend.total_attempts(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_without_fallback_retries_same_candidate() {
        let backend = Arc::new(MockBackend::new());
        backend.push("A", Err(BackendError::rate_limited("429")));
        backend.push("A", Ok(ModelResponse::text("A again")));
        let policy = RoutingPolicy {
            max_retries: 2,
            fallback_on_rate_limit: false,
            ..RoutingPolicy::default()
        };
        let (router, _) = router_with(
            Arc::clone(&backend),
            ModelChains::new().with("fast", &["A", "B"]),
            policy,
        );
        let result = router.route(Some("fast"), None, &request()).await.unwrap();
        assert_eq!(result.model_id, "A");
        assert_eq!(backend.attempts("A"), 2);
        assert_eq!(backend.attempts("B"), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_fall_back() {
        let backend = Arc::new(MockBackend::new());
        for _ in 0..3 {
            backend.push("A", Err(BackendError::server_error("502")));
        }
        let policy = RoutingPolicy {
            max_retries: 3,
            ..RoutingPolicy::default()
        };
        let (router, _) = router_with(
            Arc::clone(&backend),
            ModelChains::new().with("fast", &["A", "B"]),
            policy,
        );
        let result = router.route(Some("fast"), None, &request()).await.unwrap();
        assert_eq!(result.model_id, "B");
        assert_eq!(backend.attempts("A"), 3);
        assert_eq!(result.attempts, 4);
    }

    #[tokio::test]
    async fn test_fatal_error_without_fallback_aborts() {
        let backend = Arc::new(MockBackend::new());
        backend.push("A", Err(BackendError::invalid("bad key")));
        let policy = RoutingPolicy {
            fallback_on_error: false,
            ..RoutingPolicy::default()
        };
        let (router, _) = router_with(
            Arc::clone(&backend),
            ModelChains::new().with("fast", &["A", "B"]),
            policy,
        );
        let err = router.route(Some("fast"), None, &request()).await.unwrap_err();
        assert!(matches!(err, RouterError::Exhausted { .. }));
        assert_eq!(backend.attempts("A"), 1);
        assert_eq!(backend.attempts("B"), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_emits_one_notification_with_at_most_three_errors() {
        let backend = Arc::new(MockBackend::new());
        for id in ["A", "B", "C"] {
            for _ in 0..2 {
                backend.push(id, Err(BackendError::server_error(format!("{id} down"))));
            }
        }
        let policy = RoutingPolicy {
            max_retries: 2,
            ..RoutingPolicy::default()
        };
        let (router, bus) = router_with(
            Arc::clone(&backend),
            ModelChains::new().with("thinking", &["A", "B", "C"]),
            policy,
        );
        let mut rx = bus.subscribe();

        let err = router.route(Some("thinking"), None, &request()).await.unwrap_err();
        match err {
            RouterError::Exhausted { label, errors } => {
                assert_eq!(label, "thinking");
                assert_eq!(errors.len(), 6);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(backend.total_attempts() <= 2 * 3);

        match rx.try_recv().unwrap().event {
            Event::CriticalFailure { label, errors } => {
                assert_eq!(label, "thinking");
                assert_eq!(errors.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_snapshot_survives_chain_update() {
        let backend = Arc::new(MockBackend::new());
        let (router, _) = router_with(
            backend,
            ModelChains::new().with("fast", &["A"]),
            RoutingPolicy::default(),
        );
        let before = router.config();
        router.update_chains(ModelChains::new().with("fast", &["B"]));
        assert_eq!(before.chains.get("fast").unwrap(), &["A"]);
        assert_eq!(router.config().chains.get("fast").unwrap(), &["B"]);
    }

    #[test]
    fn test_set_chains_checks_against_current_catalog() {
        let (router, _) = router_with(
            Arc::new(MockBackend::new()),
            ModelChains::new().with("fast", &["A"]),
            RoutingPolicy::default(),
        );
        router.update_catalog(|c| c.remove("B").map(|_| ())).unwrap();

        let err = router
            .set_chains(ModelChains::new().with("fast", &["C", "B"]))
            .unwrap_err();
        assert!(matches!(err, RouterError::Catalog(CatalogError::NotFound(ref id)) if id == "B"));
        assert_eq!(router.config().chains.get("fast").unwrap(), &["A"]);

        router.set_chains(ModelChains::new().with("fast", &["C", "A"])).unwrap();
        assert_eq!(router.config().chains.get("fast").unwrap(), &["C", "A"]);
    }

    #[tokio::test]
    async fn test_initialize_reports_unreachable_models() {
        let backend = Arc::new(MockBackend::new());
        backend.mark_unreachable("C");
        let (router, _) = router_with(backend, ModelChains::new(), RoutingPolicy::default());
        let status = router.initialize().await;
        assert_eq!(status.mode, RouterMode::Direct);
        assert_eq!(status.unreachable, vec!["C".to_string()]);
        assert_eq!(status.reachable.len(), 3);
    }

    #[test]
    fn test_catalog_update_is_published() {
        let (router, _) = router_with(
            Arc::new(MockBackend::new()),
            ModelChains::new(),
            RoutingPolicy::default(),
        );
        router
            .update_catalog(|c| c.add(ModelEntry::new("E", "mock", "e", Provenance::AutoDiscovered)))
            .unwrap();
        assert!(router.config().catalog.contains("E"));
        assert!(router.update_catalog(|c| c.remove("missing").map(|_| ())).is_err());
    }
}
