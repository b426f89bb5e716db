//! LLM 层：后端抽象、模型目录与路由（OpenAI 兼容 / Mock）

pub mod catalog;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use catalog::{
    dedup_ids, CatalogError, ModelCatalog, ModelChains, ModelEntry, Provenance, RoutingPolicy,
};
pub use mock::MockBackend;
pub use openai::{OpenAiBackend, TokenUsage};
pub use router::{
    BackendSet, ModelRouter, RouterConfig, RouterError, RouterMode, RouterResponse, RouterStatus,
    BUILT_IN_DEFAULT_CHAIN,
};
pub use traits::{
    BackendError, BackendErrorKind, CompletionRequest, ModelBackend, ModelResponse, ToolSpec, Usage,
};

/// 默认后端集合：openai（OpenAI 兼容 HTTP）+ mock
pub fn default_backends(
    default_base_url: Option<&str>,
    default_api_key: Option<&str>,
    timeout: Duration,
) -> BackendSet {
    BackendSet::new()
        .with(
            "openai",
            Arc::new(OpenAiBackend::new(default_base_url, default_api_key, timeout)),
        )
        .with("mock", Arc::new(MockBackend::new()))
}
