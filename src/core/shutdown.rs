//! 关闭：信号监听、关闭原因、按顺序执行的关闭步骤
//!
//! 内核关闭顺序：停止 spawn 并排空蜂群 -> Logbook 落盘。
//! 所有步骤共享一个总时限；某一步超时后，后续步骤仍会得到最少 STEP_FLOOR 的时间。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::SwarmError;
use crate::swarm::{Logbook, SwarmManager};

const STEP_FLOOR: Duration = Duration::from_secs(1);

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// /quit 或内核 API
    Requested,
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Requested => "requested",
            ShutdownReason::Interrupted => "interrupted",
            ShutdownReason::Terminated => "terminated",
        }
    }
}

/// 进程级关闭信号；只记住第一次触发的原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 运行与后台任务从这里派生子 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；返回 true 表示这是第一次触发
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        tracing::info!(reason = reason.as_str(), "Shutdown triggered");
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C / SIGTERM 触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            manager.shutdown(reason);
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            return match tokio::signal::ctrl_c().await {
                Ok(()) => ShutdownReason::Interrupted,
                Err(_) => std::future::pending().await,
            };
        }
    };
    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => ShutdownReason::Interrupted,
        Some(()) = sigterm.recv() => ShutdownReason::Terminated,
        else => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    match tokio::signal::ctrl_c().await {
        Ok(()) => ShutdownReason::Interrupted,
        Err(_) => std::future::pending().await,
    }
}

/// 关闭流程中的一步
#[async_trait]
pub trait ShutdownStep: Send + Sync {
    fn label(&self) -> &'static str;

    async fn run(&self) -> Result<(), SwarmError>;
}

/// 各步骤的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
    pub timed_out: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// 按注册顺序执行的关闭步骤
pub struct ShutdownSequence {
    steps: Vec<Box<dyn ShutdownStep>>,
    budget: Duration,
}

impl ShutdownSequence {
    pub fn new(budget: Duration) -> Self {
        Self {
            steps: Vec::new(),
            budget,
        }
    }

    pub fn then(mut self, step: impl ShutdownStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(&self) -> ShutdownReport {
        let deadline = tokio::time::Instant::now() + self.budget;
        let mut report = ShutdownReport::default();

        for step in &self.steps {
            let label = step.label();
            let remaining = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .max(STEP_FLOOR);
            match tokio::time::timeout(remaining, step.run()).await {
                Ok(Ok(())) => {
                    tracing::debug!(step = label, "Shutdown step done");
                    report.completed.push(label);
                }
                Ok(Err(e)) => {
                    tracing::warn!(step = label, "Shutdown step failed: {}", e);
                    report.failed.push((label, e.to_string()));
                }
                Err(_) => {
                    tracing::warn!(step = label, ?remaining, "Shutdown step timed out");
                    report.timed_out.push(label);
                }
            }
        }
        report
    }
}

/// 停止接收 spawn，取消各 Agent 的运行并等待 worker 退出
pub struct SwarmDrain {
    swarm: Arc<SwarmManager>,
}

impl SwarmDrain {
    pub fn new(swarm: Arc<SwarmManager>) -> Self {
        Self { swarm }
    }
}

#[async_trait]
impl ShutdownStep for SwarmDrain {
    fn label(&self) -> &'static str {
        "swarm_drain"
    }

    async fn run(&self) -> Result<(), SwarmError> {
        self.swarm.shutdown().await;
        Ok(())
    }
}

/// 写入排队中的条目并结束写入任务
pub struct LogbookFlush {
    logbook: Arc<Logbook>,
}

impl LogbookFlush {
    pub fn new(logbook: Arc<Logbook>) -> Self {
        Self { logbook }
    }
}

#[async_trait]
impl ShutdownStep for LogbookFlush {
    fn label(&self) -> &'static str {
        "logbook_flush"
    }

    async fn run(&self) -> Result<(), SwarmError> {
        self.logbook.close().await
    }
}

/// 运行 app 直到它结束或收到关闭信号，然后执行 cleanup。
/// 返回关闭原因；app 自行结束且没有人触发关闭时为 None。
pub async fn run_with_graceful_shutdown<F, Fut>(
    signals: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) -> Option<ShutdownReason>
where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    signals.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::debug!("Application loop finished"),
        _ = signals.wait_for_shutdown() => {}
    }

    cleanup().await;
    signals.reason()
}
