//! Hive - Rust 多智能体编排内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、事件总线、审批闸门、工具扇出调度、优雅关闭、内核装配
//! - **gateway**: 入站帧协议、控制面与 WebSocket 服务器（`gateway` feature）
//! - **llm**: 模型后端抽象、模型目录 / 角色链 / 路由策略、Model Router（OpenAI 兼容 / Mock）
//! - **memory**: 对话消息模型与会话持久化
//! - **observability**: tracing 初始化
//! - **react**: Agent Runtime（会话上下文、压缩、工具调用推理循环）
//! - **swarm**: Agent 注册表、运行时注册表、消息、生成 / 终止、回收、Logbook
//! - **tools**: 工具注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod gateway;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod swarm;
pub mod tools;

pub use crate::core::{Kernel, SubmitOptions};
pub use config::{load_config, AppConfig};
