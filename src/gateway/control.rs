//! 控制面：层级 / 墓地 / 生成 / 终止，模型目录、角色链与路由策略的读写
//!
//! 所有错误统一为 ErrorPayload（稳定的 kind + 描述），供网关、终端前端与仪表盘共用。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::{ErrorKind, Kernel, SubmitOptions};
use crate::gateway::{ControlRequest, ErrorPayload, FrameReply, InboundFrame};
use crate::llm::{ModelChains, ModelEntry, Provenance};
use crate::swarm::{PersistenceMode, SpawnRequest};

pub struct ControlPlane {
    kernel: Arc<Kernel>,
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ErrorPayload> {
    serde_json::to_value(value).map_err(|e| ErrorPayload::new(ErrorKind::Internal, e.to_string()))
}

impl ControlPlane {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// 处理一个入站帧；message 帧会一直等到 run 结束
    pub async fn handle_frame(&self, frame: InboundFrame) -> FrameReply {
        match frame {
            InboundFrame::Message {
                session_id,
                content,
                model_role,
                model_id,
            } => {
                let options = SubmitOptions { model_role, model_id };
                match self.kernel.submit(&session_id, &content, options).await {
                    Ok(outcome) => FrameReply::Result {
                        session_id,
                        text: outcome.text,
                        trace_id: outcome.trace_id,
                        truncated: outcome.truncated,
                    },
                    Err(e) => FrameReply::Error {
                        request_id: None,
                        session_id: Some(session_id),
                        error: e.into(),
                    },
                }
            }
            InboundFrame::ApprovalResponse { id, approved } => {
                reply(None, self.kernel.approvals().resolve(&id, approved).map(|()| json!({ "id": id })).map_err(Into::into))
            }
            InboundFrame::InputResponse { id, response } => reply(
                None,
                self.kernel
                    .approvals()
                    .respond_input(&id, response)
                    .map(|()| json!({ "id": id }))
                    .map_err(Into::into),
            ),
            InboundFrame::Control { request_id, request } => {
                reply(request_id, self.execute(request).await)
            }
        }
    }

    /// 执行一个控制面操作
    pub async fn execute(&self, request: ControlRequest) -> Result<Value, ErrorPayload> {
        let swarm = self.kernel.swarm();
        let router = self.kernel.router();
        match request {
            ControlRequest::ListAgents => to_value(&swarm.hierarchy()?),
            ControlRequest::ListGraveyard => to_value(&swarm.graveyard()?),
            ControlRequest::Spawn {
                name,
                parent_id,
                mission,
                model_role,
                persistent,
            } => {
                let parent_id = parent_id.unwrap_or_else(|| self.kernel.root().id.clone());
                let parent = swarm
                    .registry()
                    .get_active(&parent_id)
                    .map_err(|e| ErrorPayload::new(ErrorKind::Internal, e.to_string()))?
                    .ok_or_else(|| ErrorPayload::new(ErrorKind::SpawnRejected, format!("parent not active: {}", parent_id)))?;
                let persistence = if persistent {
                    PersistenceMode::Persistent
                } else {
                    PersistenceMode::Ephemeral
                };
                let spawned = swarm
                    .spawn(
                        SpawnRequest::child_of(&parent, name, mission)
                            .with_model_role(model_role)
                            .with_persistence(persistence),
                    )
                    .await?;
                Ok(json!({ "agent": to_value(&spawned.record)?, "created": spawned.created }))
            }
            ControlRequest::Terminate { id, reason } => {
                let reason = reason.unwrap_or_else(|| "requested".to_string());
                let terminated = swarm.terminate(&id, &reason).await?;
                Ok(json!({ "id": id, "terminated": terminated }))
            }
            ControlRequest::GetCatalog => to_value(&router.config().catalog.entries()),
            ControlRequest::AddModel {
                id,
                provider,
                model,
                base_url,
                api_key,
            } => {
                let mut entry = ModelEntry::new(&id, provider, model.unwrap_or_else(|| id.clone()), Provenance::UserAdded);
                entry.base_url = base_url;
                entry.api_key = api_key;
                router.update_catalog(|c| c.add(entry))?;
                Ok(json!({ "id": id }))
            }
            ControlRequest::EditModel { id, base_url, api_key } => {
                router.update_catalog(|c| c.edit_connection(&id, base_url, api_key))?;
                Ok(json!({ "id": id }))
            }
            ControlRequest::RemoveModel { id } => {
                router.update_catalog(|c| c.remove(&id).map(|_| ()))?;
                Ok(json!({ "id": id }))
            }
            ControlRequest::GetChains => to_value(&router.config().chains),
            ControlRequest::UpdateChains { chains } => {
                router.set_chains(ModelChains::from_map(chains))?;
                to_value(&router.config().chains)
            }
            ControlRequest::GetRouting => to_value(router.policy().as_ref()),
            ControlRequest::UpdateRouting { policy } => {
                router.update_routing(policy);
                to_value(router.policy().as_ref())
            }
            ControlRequest::Logbook { limit } => to_value(&self.kernel.logbook().recent(limit).await?),
            ControlRequest::PendingApprovals => to_value(&self.kernel.approvals().pending()),
            ControlRequest::Status => {
                let status = self.kernel.router_status();
                Ok(json!({
                    "root": self.kernel.root().id,
                    "mode": status.mode,
                    "reachable": status.reachable,
                    "unreachable": status.unreachable,
                    "runtimes": swarm.runtimes().len().await,
                    "accepting": swarm.is_accepting(),
                }))
            }
        }
    }
}

fn reply(request_id: Option<String>, result: Result<Value, ErrorPayload>) -> FrameReply {
    match result {
        Ok(data) => FrameReply::Ack { request_id, data },
        Err(error) => FrameReply::Error {
            request_id,
            session_id: None,
            error,
        },
    }
}
