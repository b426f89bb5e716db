//! 模型目录、角色链与路由策略
//!
//! - ModelEntry：id 即身份，创建后只允许修改凭据 / base_url
//! - ModelChains：角色 -> 有序去重的模型 id 列表（顺序即回退优先级）
//! - RoutingPolicy：每个候选的最大尝试次数、限流 / 其他错误时是否回退

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 模型条目来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    BuiltIn,
    UserAdded,
    AutoDiscovered,
}

/// 单个模型条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    /// 后端提供方（openai / mock / ...），决定使用哪个 ModelBackend
    pub provider: String,
    /// 发给后端的模型名
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// 凭据不对外序列化
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub provenance: Provenance,
}

impl ModelEntry {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            model: model.into(),
            base_url: None,
            api_key: None,
            provenance,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Model id already exists: {0}")]
    DuplicateId(String),

    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Built-in model cannot be removed: {0}")]
    BuiltInImmutable(String),
}

/// 模型目录：按插入顺序保存条目
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置模型：未配置任何模型时也能跑通
    pub fn built_in() -> Self {
        Self {
            entries: vec![
                ModelEntry::new("gpt-4o-mini", "openai", "gpt-4o-mini", Provenance::BuiltIn),
                ModelEntry::new("gpt-4o", "openai", "gpt-4o", Provenance::BuiltIn),
                ModelEntry::new("mock", "mock", "mock", Provenance::BuiltIn),
            ],
        }
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// 新增条目；id 重复时拒绝（身份不可变）
    pub fn add(&mut self, entry: ModelEntry) -> Result<(), CatalogError> {
        if self.contains(&entry.id) {
            return Err(CatalogError::DuplicateId(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// 新增或覆盖凭据：已存在时只更新 base_url / api_key
    pub fn upsert(&mut self, entry: ModelEntry) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                if entry.base_url.is_some() {
                    existing.base_url = entry.base_url;
                }
                if entry.api_key.is_some() {
                    existing.api_key = entry.api_key;
                }
            }
            None => self.entries.push(entry),
        }
    }

    /// 修改凭据 / base_url；其余字段保持不变
    pub fn edit_connection(
        &mut self,
        id: &str,
        base_url: Option<String>,
        api_key: Option<String>,
    ) -> Result<(), CatalogError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        if base_url.is_some() {
            entry.base_url = base_url;
        }
        if api_key.is_some() {
            entry.api_key = api_key;
        }
        Ok(())
    }

    /// 删除用户添加 / 自动发现的条目
    pub fn remove(&mut self, id: &str) -> Result<ModelEntry, CatalogError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        if self.entries[idx].provenance == Provenance::BuiltIn {
            return Err(CatalogError::BuiltInImmutable(id.to_string()));
        }
        Ok(self.entries.remove(idx))
    }
}

/// 有序去重，保留首次出现的位置
pub fn dedup_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for id in ids {
        let id = id.into();
        if !id.is_empty() && !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// 角色 -> 模型链
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelChains {
    chains: HashMap<String, Vec<String>>,
}

impl ModelChains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, Vec<String>>) -> Self {
        let mut chains = Self::new();
        for (role, ids) in map {
            chains.set(role, ids);
        }
        chains
    }

    /// 设置角色链（自动去重）
    pub fn set(&mut self, role: impl Into<String>, ids: Vec<String>) {
        self.chains.insert(role.into(), dedup_ids(ids));
    }

    pub fn with(mut self, role: impl Into<String>, ids: &[&str]) -> Self {
        self.set(role, ids.iter().map(|s| s.to_string()).collect());
        self
    }

    /// 角色链；不存在或为空时返回 None
    pub fn get(&self, role: &str) -> Option<&[String]> {
        self.chains
            .get(role)
            .map(|v| v.as_slice())
            .filter(|v| !v.is_empty())
    }

    /// 所有链中出现的模型 id
    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.chains.values().flatten().map(String::as_str)
    }

    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.chains.keys().cloned().collect();
        roles.sort();
        roles
    }
}

/// 路由策略（热替换；进行中的调用保留开始时的快照）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// 每个候选最多尝试次数（至少 1）
    pub max_retries: u32,
    /// 限流时是否立即切到下一个候选
    pub fallback_on_rate_limit: bool,
    /// 其他错误时是否切到下一个候选
    pub fallback_on_error: bool,
    /// 重试退避基数（毫秒），第 n 次重试等待 base * 2^(n-1)
    pub backoff_base_ms: u64,
    /// 单次退避上限（毫秒）
    pub backoff_max_ms: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            fallback_on_rate_limit: true,
            fallback_on_error: true,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
        }
    }
}

impl RoutingPolicy {
    /// 每个候选的有效尝试次数
    pub fn attempts_per_candidate(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn backoff(&self, retry: u32) -> std::time::Duration {
        if self.backoff_base_ms == 0 || retry == 0 {
            return std::time::Duration::ZERO;
        }
        let factor = 1u64 << (retry - 1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        std::time::Duration::from_millis(ms)
    }

    /// 测试用：不退避
    pub fn without_backoff(mut self) -> Self {
        self.backoff_base_ms = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_is_deduplicated_in_order() {
        let chains = ModelChains::new().with("fast", &["a", "b", "a", "c", "b"]);
        assert_eq!(chains.get("fast").unwrap(), &["a", "b", "c"]);
    }

    #[test]
    fn test_empty_chain_reads_as_missing() {
        let chains = ModelChains::new().with("thinking", &[]);
        assert!(chains.get("thinking").is_none());
    }

    #[test]
    fn test_catalog_identity_is_immutable() {
        let mut catalog = ModelCatalog::built_in();
        let dup = ModelEntry::new("gpt-4o", "openai", "other", Provenance::UserAdded);
        assert_eq!(
            catalog.add(dup),
            Err(CatalogError::DuplicateId("gpt-4o".to_string()))
        );

        catalog
            .edit_connection("gpt-4o", Some("http://proxy".into()), Some("sk".into()))
            .unwrap();
        let entry = catalog.get("gpt-4o").unwrap();
        assert_eq!(entry.model, "gpt-4o");
        assert_eq!(entry.base_url.as_deref(), Some("http://proxy"));
        assert!(entry.has_credential());
    }

    #[test]
    fn test_built_in_entries_cannot_be_removed() {
        let mut catalog = ModelCatalog::built_in();
        assert!(matches!(
            catalog.remove("mock"),
            Err(CatalogError::BuiltInImmutable(_))
        ));
        catalog
            .add(ModelEntry::new("local", "openai", "llama3", Provenance::UserAdded))
            .unwrap();
        assert_eq!(catalog.remove("local").unwrap().model, "llama3");
    }

    #[test]
    fn test_credentials_are_not_serialized() {
        let entry = ModelEntry::new("x", "openai", "m", Provenance::UserAdded).with_api_key("secret");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RoutingPolicy {
            backoff_base_ms: 100,
            backoff_max_ms: 300,
            ..RoutingPolicy::default()
        };
        assert_eq!(policy.backoff(1).as_millis(), 100);
        assert_eq!(policy.backoff(2).as_millis(), 200);
        assert_eq!(policy.backoff(5).as_millis(), 300);
        assert_eq!(policy.without_backoff().backoff(3).as_millis(), 0);
    }
}
