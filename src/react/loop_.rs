//! Agent Runtime：工具调用推理主循环
//!
//! 每次 run：输入追加到会话上下文 -> （超过软上限时压缩）-> 调用 Model Router ->
//! 直接回答则结束；工具调用则并发执行、结果写回上下文后进入下一轮。
//! 受 max_iterations 限制：到达上限时返回部分回答并附带诊断标记，而不是报错。
//!
//! 快照规则：路由策略在 run 开始时取一次；角色链与工具目录在每轮开始时重新取，
//! 所以配置更新只会在迭代边界生效。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Envelope, Event, EventBus};
use crate::llm::{CompletionRequest, ModelRouter};
use crate::memory::{is_internal_session, Message, SessionStore};
use crate::react::{compact, Compactor, ConversationContext};
use crate::swarm::{AgentRecord, LogEvent, Logbook, LogbookEntry};
use crate::tools::{ToolCatalog, ToolContext, ToolExecutor};

/// 单次 run 的默认最大迭代数，防止死循环
pub const DEFAULT_MAX_ITERATIONS: usize = 12;
/// 到达迭代上限时附加在回答末尾的诊断标记
pub const MAX_ITERATIONS_MARKER: &str = "[max_iterations reached";
/// 工具结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

/// 运行时参数
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub max_iterations: usize,
    /// 上下文软上限（字符数）
    pub context_soft_limit_chars: usize,
    /// 压缩时保留的最近轮数
    pub keep_recent_turns: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context_soft_limit_chars: 24_000,
            keep_recent_turns: 4,
        }
    }
}

/// Agent 身份：决定系统提示与默认模型角色
#[derive(Debug, Clone, Default)]
pub struct AgentIdentity {
    pub agent_id: Option<String>,
    pub name: String,
    pub tier: u32,
    pub mission: String,
    pub model_role: Option<String>,
    /// 基础系统提示（配置提供）
    pub base_prompt: String,
}

impl AgentIdentity {
    pub fn from_record(record: &AgentRecord, base_prompt: &str) -> Self {
        Self {
            agent_id: Some(record.id.clone()),
            name: record.name.clone(),
            tier: record.tier,
            mission: record.mission.clone(),
            model_role: record.model_role.clone(),
            base_prompt: base_prompt.to_string(),
        }
    }
}

/// 所有 Agent 共享的协作者（路由器、工具目录、执行器……）
#[derive(Clone)]
pub struct RuntimeDeps {
    pub router: Arc<ModelRouter>,
    pub tools: Arc<ToolCatalog>,
    pub executor: Arc<ToolExecutor>,
    pub bus: Arc<EventBus>,
    pub compactor: Arc<dyn Compactor>,
    pub logbook: Option<Arc<Logbook>>,
    pub sessions: Option<Arc<SessionStore>>,
    pub settings: RuntimeSettings,
}

/// 单次 run 的选项
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model_role: Option<String>,
    pub model_id: Option<String>,
    pub task_name: Option<String>,
    pub cancel: Option<CancellationToken>,
    pub max_iterations: Option<usize>,
}

impl RunOptions {
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.model_role = Some(role.into());
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task_name = Some(task.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }
}

/// 工具调用轨迹（按调用顺序）
#[derive(Debug, Clone, Serialize)]
pub struct ToolTrace {
    pub call_id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub ok: bool,
    pub output: String,
}

/// run 的结果
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub text: String,
    pub trace: Vec<ToolTrace>,
    pub trace_id: String,
    pub iterations: usize,
    /// 是否因迭代上限而截断
    pub truncated: bool,
    pub model_id: Option<String>,
}

type SharedContext = Arc<Mutex<ConversationContext>>;

/// 单个 Agent 的运行时：按会话持有各自的上下文
pub struct AgentRuntime {
    deps: RuntimeDeps,
    identity: AgentIdentity,
    system_prompt: RwLock<String>,
    sessions: Mutex<HashMap<String, SharedContext>>,
}

impl AgentRuntime {
    pub fn new(deps: RuntimeDeps, identity: AgentIdentity) -> Self {
        let runtime = Self {
            deps,
            identity,
            system_prompt: RwLock::new(String::new()),
            sessions: Mutex::new(HashMap::new()),
        };
        runtime.refresh_system_prompt();
        runtime
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.identity.agent_id.as_deref()
    }

    pub fn system_prompt(&self) -> String {
        self.system_prompt
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn build_system_prompt(&self) -> String {
        let mut prompt = self.identity.base_prompt.trim().to_string();
        if !self.identity.name.is_empty() {
            prompt.push_str(&format!(
                "\n\nYou are agent '{}' (tier {}).",
                self.identity.name, self.identity.tier
            ));
        }
        if !self.identity.mission.is_empty() {
            prompt.push_str(&format!("\nMission: {}", self.identity.mission));
        }
        let tools = self.deps.tools.snapshot().tool_descriptions();
        if !tools.is_empty() {
            prompt.push_str("\n\nAvailable tools:");
            for (name, desc) in tools {
                prompt.push_str(&format!("\n- {}: {}", name, desc));
            }
        }
        prompt.trim_start().to_string()
    }

    /// 由身份与当前工具目录重新生成系统提示；在两次 run 之间调用，下一次 run 开始时生效
    pub fn refresh_system_prompt(&self) {
        let prompt = self.build_system_prompt();
        *self
            .system_prompt
            .write()
            .unwrap_or_else(|p| p.into_inner()) = prompt;
    }

    fn new_context(&self) -> ConversationContext {
        ConversationContext::new(
            self.system_prompt(),
            self.deps.settings.context_soft_limit_chars,
            self.deps.settings.keep_recent_turns,
        )
    }

    async fn context(&self, session_id: &str) -> SharedContext {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(self.new_context()))),
        )
    }

    /// 首次 run 之前载入已持久化的消息；内部会话（system: / swarm: / cron:）不载入
    pub async fn seed_context(&self, session_id: &str, messages: Vec<Message>) -> bool {
        if is_internal_session(session_id) || messages.is_empty() {
            return false;
        }
        let ctx = self.context(session_id).await;
        let mut ctx = ctx.lock().await;
        let count = messages.len();
        ctx.seed(messages);
        tracing::debug!(session_id, count, "Context seeded");
        true
    }

    /// 丢弃会话内容，保留身份与工具配置
    pub async fn reset_context(&self, session_id: &str) -> bool {
        let existing = self.sessions.lock().await.get(session_id).cloned();
        match existing {
            Some(ctx) => {
                ctx.lock().await.reset();
                self.persist(session_id, &[]);
                true
            }
            None => false,
        }
    }

    /// 会话当前的消息（含摘要）
    pub async fn session_messages(&self, session_id: &str) -> Option<Vec<Message>> {
        let ctx = self.sessions.lock().await.get(session_id).cloned()?;
        let messages = ctx.lock().await.persistable();
        Some(messages)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn persist(&self, session_id: &str, messages: &[Message]) {
        if is_internal_session(session_id) {
            return;
        }
        if let Some(store) = &self.deps.sessions {
            if let Err(e) = store.save(session_id, messages) {
                tracing::warn!(session_id, "Failed to persist session: {}", e);
            }
        }
    }

    fn emit(&self, session_id: &str, event: Event) {
        let mut envelope = Envelope::new(event).with_session(session_id);
        envelope.agent_id = self.identity.agent_id.clone();
        self.deps.bus.publish(envelope);
    }

    /// 执行一次完整的推理循环
    pub async fn run(
        &self,
        input: &str,
        session_id: &str,
        options: RunOptions,
    ) -> Result<RunOutcome, AgentError> {
        let shared = self.context(session_id).await;
        // 同一会话同一时刻只有一个 run
        let mut ctx = shared.lock().await;
        ctx.set_system_prompt(self.system_prompt());
        ctx.push(Message::user(input));

        let result = self.run_loop(&mut ctx, session_id, &options).await;
        self.persist(session_id, &ctx.persistable());
        result
    }

    async fn run_loop(
        &self,
        ctx: &mut ConversationContext,
        session_id: &str,
        options: &RunOptions,
    ) -> Result<RunOutcome, AgentError> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let max_iterations = options
            .max_iterations
            .unwrap_or(self.deps.settings.max_iterations)
            .max(1);
        let cancel = options.cancel.clone().unwrap_or_default();
        let policy = self.deps.router.policy();
        let requested = options
            .model_id
            .as_deref()
            .or(options.model_role.as_deref())
            .or(self.identity.model_role.as_deref());
        let task_name = options.task_name.as_deref();
        let label = task_name.or(requested).unwrap_or("default").to_string();
        let tool_ctx = ToolContext::new(session_id, self.identity.agent_id.clone());

        let mut trace: Vec<ToolTrace> = Vec::new();
        let mut partial = String::new();
        let mut last_model: Option<String> = None;

        tracing::info!(session_id, trace_id = %trace_id, agent = %self.identity.name, "Run started");

        for step in 1..=max_iterations {
            if cancel.is_cancelled() {
                tracing::info!(session_id, step, "Run cancelled");
                return Err(AgentError::Cancelled);
            }
            self.emit(session_id, Event::StepUpdate { step, max_steps: max_iterations });

            if ctx.needs_compaction() {
                let removed = compact(ctx, self.deps.compactor.as_ref()).await;
                if removed > 0 {
                    tracing::info!(session_id, removed, "Context compacted");
                    self.emit(session_id, Event::Compacted { removed });
                }
            }

            let tools = self.deps.tools.snapshot();
            let candidates = self.deps.router.resolve_candidates(requested, task_name)?;
            let request = CompletionRequest {
                messages: ctx.request_messages(),
                tools: tools.specs(),
            };

            let routed = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(session_id, step, "Run cancelled while awaiting model");
                    return Err(AgentError::Cancelled);
                }
                result = self.deps.router.complete(&policy, &label, &candidates, &request) => result,
            };
            let routed = match routed {
                Ok(routed) => routed,
                Err(e) => {
                    self.record_failure(session_id, &e.to_string());
                    return Err(AgentError::Router(e));
                }
            };

            if let Some(usage) = routed.response.usage {
                self.emit(
                    session_id,
                    Event::Usage {
                        model_id: routed.model_id.clone(),
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                    },
                );
            }
            last_model = Some(routed.model_id.clone());
            let response = routed.response;

            if response.tool_calls.is_empty() {
                ctx.push(Message::assistant(response.content.clone()));
                self.emit(
                    session_id,
                    Event::FinalAnswer {
                        delta: response.content.clone(),
                        trace_id: trace_id.clone(),
                    },
                );
                tracing::info!(session_id, trace_id = %trace_id, steps = step, "Run finished");
                return Ok(RunOutcome {
                    text: response.content,
                    trace,
                    trace_id,
                    iterations: step,
                    truncated: false,
                    model_id: last_model,
                });
            }

            if !response.content.trim().is_empty() {
                partial = response.content.clone();
                self.emit(
                    session_id,
                    Event::Reasoning {
                        delta: response.content.clone(),
                    },
                );
            }
            ctx.push(Message::assistant_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                self.emit(
                    session_id,
                    Event::ToolCall {
                        call_id: call.id.clone(),
                        tool: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                );
            }

            let outcomes = self
                .deps
                .executor
                .execute_batch(&tools, &tool_ctx, &response.tool_calls)
                .await;
            for outcome in outcomes {
                let content = outcome.content();
                self.emit(
                    session_id,
                    Event::ToolResult {
                        call_id: outcome.call.id.clone(),
                        tool: outcome.call.name.clone(),
                        ok: outcome.is_ok(),
                        preview: preview(&content),
                    },
                );
                ctx.push(outcome.to_message());
                trace.push(ToolTrace {
                    call_id: outcome.call.id.clone(),
                    tool: outcome.call.name.clone(),
                    arguments: outcome.call.arguments.clone(),
                    ok: outcome.is_ok(),
                    output: content,
                });
            }
        }

        let note = format!(
            "{}: stopped after {} iterations without a final answer]",
            MAX_ITERATIONS_MARKER, max_iterations
        );
        let text = if partial.is_empty() {
            note
        } else {
            format!("{}\n\n{}", partial, note)
        };
        tracing::warn!(session_id, trace_id = %trace_id, max_iterations, "Run hit iteration cap");
        ctx.push(Message::assistant(text.clone()));
        self.emit(
            session_id,
            Event::FinalAnswer {
                delta: text.clone(),
                trace_id: trace_id.clone(),
            },
        );
        Ok(RunOutcome {
            text,
            trace,
            trace_id,
            iterations: max_iterations,
            truncated: true,
            model_id: last_model,
        })
    }

    fn record_failure(&self, session_id: &str, detail: &str) {
        self.emit(
            session_id,
            Event::Error {
                kind: "critical_failure".to_string(),
                message: detail.to_string(),
            },
        );
        if let Some(logbook) = &self.deps.logbook {
            let mut entry = LogbookEntry::new(LogEvent::CriticalFailure, detail);
            if !self.identity.name.is_empty() {
                entry.agent_name = Some(self.identity.name.clone());
                entry.tier = Some(self.identity.tier);
            }
            logbook.append(entry);
        }
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}
