//! 审批闸门与人工输入请求
//!
//! 需要审批的工具调用会挂起当前调用（不影响其他 Agent）：ApprovalManager 创建 ApprovalRequest，
//! 在总线上发布 approval_request，然后在一次性通道上等待 approval_response；超时或取消按拒绝处理。
//! 请求一旦终结即不可再次解决，id 不复用。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::{ApprovalError, Envelope, Event, EventBus};

/// 审批策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// 等待外部决策
    #[default]
    Ask,
    AutoApprove,
    AutoDeny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

/// 发起审批时携带的上下文
#[derive(Debug, Clone, Default)]
pub struct ApprovalContext {
    pub kind: String,
    pub description: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied(String),
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

/// 审批请求记录
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub kind: String,
    pub description: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

/// 审批回调：可以立即决定（策略），也可以阻塞等待外部参与者
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request_approval(&self, ctx: ApprovalContext) -> ApprovalDecision;
}

/// 固定策略闸门（测试 / 无人值守）
pub struct StaticGate(pub bool);

#[async_trait]
impl ApprovalGate for StaticGate {
    async fn request_approval(&self, _ctx: ApprovalContext) -> ApprovalDecision {
        if self.0 {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied("denied by policy".to_string())
        }
    }
}

/// 保留终结状态的请求数
const RESOLVED_HISTORY: usize = 1024;

/// 最近终结的请求，超出上限时淘汰最旧的
#[derive(Default)]
struct ResolvedLog {
    statuses: HashMap<String, ApprovalStatus>,
    order: VecDeque<String>,
}

impl ResolvedLog {
    fn record(&mut self, id: &str, status: ApprovalStatus, limit: usize) {
        if self.statuses.insert(id.to_string(), status).is_none() {
            self.order.push_back(id.to_string());
        }
        while self.order.len() > limit {
            if let Some(oldest) = self.order.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }
}

struct PendingApproval {
    request: ApprovalRequest,
    tx: oneshot::Sender<bool>,
}

/// 审批与输入请求管理器
pub struct ApprovalManager {
    policy: ApprovalPolicy,
    timeout: Duration,
    bus: Arc<EventBus>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    /// 最近终结的请求；id 为 uuid，被淘汰的 id 只会得到 NotPending
    resolved: Mutex<ResolvedLog>,
    history: usize,
    inputs: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl ApprovalManager {
    pub fn new(policy: ApprovalPolicy, timeout: Duration, bus: Arc<EventBus>) -> Self {
        Self {
            policy,
            timeout,
            bus,
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(ResolvedLog::default()),
            history: RESOLVED_HISTORY,
            inputs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolved_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// 当前挂起的审批请求
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<ApprovalRequest> = pending.values().map(|p| p.request.clone()).collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// 已终结请求的状态
    pub fn status(&self, id: &str) -> Option<ApprovalStatus> {
        if self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(id)
        {
            return Some(ApprovalStatus::Pending);
        }
        self.resolved
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .statuses
            .get(id)
            .copied()
    }

    fn finish(&self, id: &str, status: ApprovalStatus) -> Option<PendingApproval> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        if entry.is_some() {
            self.resolved
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .record(id, status, self.history);
        }
        entry
    }

    /// 外部决策（approval_response）
    pub fn resolve(&self, id: &str, approved: bool) -> Result<(), ApprovalError> {
        let status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        let entry = self
            .finish(id, status)
            .ok_or_else(|| ApprovalError::NotPending(id.to_string()))?;
        tracing::info!(approval_id = %id, approved, kind = %entry.request.kind, "Approval resolved");
        // 等待方可能已超时离开
        let _ = entry.tx.send(approved);
        Ok(())
    }

    /// 取消一个挂起的审批（等待方收到拒绝）
    pub fn cancel(&self, id: &str) -> Result<(), ApprovalError> {
        self.finish(id, ApprovalStatus::Denied)
            .map(|_| ())
            .ok_or_else(|| ApprovalError::NotPending(id.to_string()))
    }

    /// 关闭时取消全部挂起请求
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        let approvals = ids.iter().filter(|id| self.cancel(id).is_ok()).count();

        let mut inputs = self.inputs.lock().unwrap_or_else(|p| p.into_inner());
        let input_count = inputs.len();
        inputs.clear();
        approvals + input_count
    }

    async fn ask(&self, ctx: ApprovalContext) -> ApprovalDecision {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let request = ApprovalRequest {
            id: id.clone(),
            kind: ctx.kind.clone(),
            description: ctx.description.clone(),
            session_id: ctx.session_id.clone(),
            agent_id: ctx.agent_id.clone(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        };
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), PendingApproval { request, tx });

        let mut envelope = Envelope::new(Event::ApprovalRequest {
            id: id.clone(),
            kind: ctx.kind.clone(),
            description: ctx.description.clone(),
        });
        envelope.session_id = ctx.session_id;
        envelope.agent_id = ctx.agent_id;
        self.bus.publish(envelope);
        tracing::info!(approval_id = %id, kind = %ctx.kind, "Awaiting approval");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(true)) => ApprovalDecision::Approved,
            Ok(Ok(false)) => ApprovalDecision::Denied("denied by user".to_string()),
            Ok(Err(_)) => ApprovalDecision::Denied("approval cancelled".to_string()),
            Err(_) => {
                self.finish(&id, ApprovalStatus::Denied);
                tracing::warn!(approval_id = %id, "Approval timed out, treating as denial");
                ApprovalDecision::Denied(format!(
                    "approval timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }

    /// 请求人工输入（input_request / input_response）
    pub async fn request_input(
        &self,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<String, ApprovalError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inputs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), tx);

        let mut envelope = Envelope::new(Event::InputRequest {
            id: id.clone(),
            prompt: prompt.to_string(),
        });
        envelope.session_id = session_id.map(String::from);
        self.bus.publish(envelope);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ApprovalError::Cancelled(id)),
            Err(_) => {
                self.inputs
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&id);
                Err(ApprovalError::TimedOut(id))
            }
        }
    }

    /// 外部输入（input_response）
    pub fn respond_input(&self, id: &str, response: String) -> Result<(), ApprovalError> {
        let tx = self
            .inputs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id)
            .ok_or_else(|| ApprovalError::NotPending(id.to_string()))?;
        let _ = tx.send(response);
        Ok(())
    }
}

#[async_trait]
impl ApprovalGate for ApprovalManager {
    async fn request_approval(&self, ctx: ApprovalContext) -> ApprovalDecision {
        match self.policy {
            ApprovalPolicy::AutoApprove => ApprovalDecision::Approved,
            ApprovalPolicy::AutoDeny => ApprovalDecision::Denied("denied by policy".to_string()),
            ApprovalPolicy::Ask => self.ask(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(policy: ApprovalPolicy, timeout_ms: u64) -> (Arc<ApprovalManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(16));
        (
            Arc::new(ApprovalManager::new(
                policy,
                Duration::from_millis(timeout_ms),
                Arc::clone(&bus),
            )),
            bus,
        )
    }

    fn ctx() -> ApprovalContext {
        ApprovalContext {
            kind: "terminate_agent".into(),
            description: "terminate worker-1".into(),
            session_id: Some("s1".into()),
            agent_id: None,
        }
    }

    #[tokio::test]
    async fn test_ask_resolves_from_external_response() {
        let (mgr, bus) = manager(ApprovalPolicy::Ask, 5_000);
        let mut rx = bus.subscribe();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.request_approval(ctx()).await })
        };

        let id = match rx.recv().await.unwrap().event {
            Event::ApprovalRequest { id, .. } => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(mgr.pending().len(), 1);
        mgr.resolve(&id, true).unwrap();

        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Approved);
        assert_eq!(mgr.status(&id), Some(ApprovalStatus::Approved));
        // 终结后不可再次解决
        assert!(matches!(mgr.resolve(&id, false), Err(ApprovalError::NotPending(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_denial() {
        let (mgr, _bus) = manager(ApprovalPolicy::Ask, 20);
        let decision = mgr.request_approval(ctx()).await;
        assert!(!decision.is_approved());
        assert!(mgr.pending().is_empty());
    }

    #[tokio::test]
    async fn test_policies_resolve_immediately() {
        let (approve, _) = manager(ApprovalPolicy::AutoApprove, 10);
        assert!(approve.request_approval(ctx()).await.is_approved());
        let (deny, _) = manager(ApprovalPolicy::AutoDeny, 10);
        assert!(!deny.request_approval(ctx()).await.is_approved());
    }

    #[tokio::test]
    async fn test_input_request_round_trip() {
        let (mgr, bus) = manager(ApprovalPolicy::Ask, 5_000);
        let mut rx = bus.subscribe();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.request_input("Which branch?", Some("s1")).await })
        };
        let id = match rx.recv().await.unwrap().event {
            Event::InputRequest { id, .. } => id,
            other => panic!("unexpected {:?}", other),
        };
        mgr.respond_input(&id, "main".into()).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), "main");
    }

    #[tokio::test]
    async fn test_resolved_history_is_bounded() {
        let bus = Arc::new(EventBus::new(16));
        let mgr = Arc::new(
            ApprovalManager::new(ApprovalPolicy::Ask, Duration::from_secs(5), Arc::clone(&bus))
                .with_resolved_history(2),
        );
        let mut rx = bus.subscribe();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let waiter = {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.request_approval(ctx()).await })
            };
            let id = match rx.recv().await.unwrap().event {
                Event::ApprovalRequest { id, .. } => id,
                other => panic!("unexpected {:?}", other),
            };
            mgr.resolve(&id, true).unwrap();
            waiter.await.unwrap();
            ids.push(id);
        }

        assert_eq!(mgr.status(&ids[0]), None);
        assert_eq!(mgr.status(&ids[1]), Some(ApprovalStatus::Approved));
        assert_eq!(mgr.status(&ids[2]), Some(ApprovalStatus::Approved));
        // 淘汰后仍不可再次解决
        assert!(matches!(mgr.resolve(&ids[0], false), Err(ApprovalError::NotPending(_))));
    }
}
