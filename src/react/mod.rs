//! Agent Runtime：会话上下文、压缩与工具调用推理循环

pub mod compactor;
pub mod context;
pub mod loop_;

pub use compactor::{compact, Compactor, DigestCompactor, ModelCompactor};
pub use context::ConversationContext;
pub use loop_::{
    AgentIdentity, AgentRuntime, RunOptions, RunOutcome, RuntimeDeps, RuntimeSettings, ToolTrace,
    DEFAULT_MAX_ITERATIONS, MAX_ITERATIONS_MARKER,
};
