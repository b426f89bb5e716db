//! 核心层：错误分类、事件总线、审批闸门、工具扇出调度、优雅关闭与内核装配

pub mod approval;
pub mod error;
pub mod events;
pub mod kernel;
pub mod shutdown;
pub mod task_scheduler;

pub use approval::{
    ApprovalContext, ApprovalDecision, ApprovalGate, ApprovalManager, ApprovalPolicy,
    ApprovalRequest, ApprovalStatus, StaticGate,
};
pub use error::{catalog_error_kind, AgentError, ApprovalError, ErrorKind, SwarmError};
pub use events::{Envelope, Event, EventBus};
pub use kernel::{Kernel, KernelStorage, SubmitOptions};
pub use shutdown::{
    run_with_graceful_shutdown, LogbookFlush, ShutdownManager, ShutdownReason, ShutdownReport,
    ShutdownSequence, ShutdownStep, SwarmDrain,
};
pub use task_scheduler::{TaskScheduler, ToolTurn};
