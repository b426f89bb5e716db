//! Swarm Sweeper：周期扫描，回收长时间不活跃的 ephemeral Agent

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::SwarmError;
use crate::swarm::SwarmManager;

/// 哪些状态的 Agent 可以被回收
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPolicy {
    /// 只回收 idle
    #[default]
    IdleOnly,
    /// working 超时也回收（运行会被取消）
    IdleAndWorking,
}

pub struct SwarmSweeper {
    manager: Arc<SwarmManager>,
    interval: Duration,
    idle_timeout: Duration,
    policy: SweepPolicy,
}

impl SwarmSweeper {
    pub fn new(manager: Arc<SwarmManager>, interval: Duration, idle_timeout: Duration, policy: SweepPolicy) -> Self {
        Self {
            manager,
            interval,
            idle_timeout,
            policy,
        }
    }

    pub async fn sweep_once(&self) -> Result<Vec<String>, SwarmError> {
        let reclaimed = self
            .manager
            .sweep(Utc::now(), self.idle_timeout, self.policy)
            .await?;
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "Sweeper reclaimed idle agents");
        }
        Ok(reclaimed)
    }

    /// 后台运行，直到 token 被取消
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !self.manager.is_accepting() {
                            break;
                        }
                        if let Err(e) = self.sweep_once().await {
                            tracing::warn!("Sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Sweeper stopped");
        })
    }
}
