//! Agent Runtime 集成测试：迭代上限、审批拒绝、临界失败、事件顺序与会话持久化

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::core::{AgentError, ApprovalGate, ErrorKind, Event, EventBus, StaticGate, TaskScheduler};
    use hive::llm::{
        BackendError, BackendSet, MockBackend, ModelCatalog, ModelChains, ModelResponse, ModelRouter,
        RouterConfig, RoutingPolicy,
    };
    use hive::memory::{Message, Role, SessionStore, ToolCall};
    use hive::react::{
        AgentIdentity, AgentRuntime, DigestCompactor, RunOptions, RuntimeDeps, RuntimeSettings,
        MAX_ITERATIONS_MARKER,
    };
    use hive::swarm::{Database, Logbook};
    use hive::tools::{EchoTool, Tool, ToolCatalog, ToolContext, ToolExecutor, ToolRegistry};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    /// 需要审批的工具
    struct LaunchTool;

    #[async_trait]
    impl Tool for LaunchTool {
        fn name(&self) -> &str {
            "launch"
        }

        fn description(&self) -> &str {
            "Launch something irreversible"
        }

        fn requires_approval(&self) -> bool {
            true
        }

        async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<String, String> {
            Ok("launched".into())
        }
    }

    struct Harness {
        mock: Arc<MockBackend>,
        bus: Arc<EventBus>,
        deps: RuntimeDeps,
    }

    fn harness(gate: Arc<dyn ApprovalGate>) -> Harness {
        let mock = Arc::new(MockBackend::new());
        let bus = Arc::new(EventBus::new(256));
        let router = Arc::new(ModelRouter::new(
            RouterConfig::new(ModelCatalog::built_in(), ModelChains::new()).with_default_chain(&["mock"]),
            RoutingPolicy::default().without_backoff(),
            BackendSet::new().with("mock", mock.clone()),
            Arc::clone(&bus),
        ));
        let tools = ToolRegistry::new().with(EchoTool).with(LaunchTool);
        let deps = RuntimeDeps {
            router,
            tools: Arc::new(ToolCatalog::new(tools)),
            executor: Arc::new(ToolExecutor::new(
                Duration::from_secs(5),
                TaskScheduler::new(3),
                gate,
            )),
            bus: Arc::clone(&bus),
            compactor: Arc::new(DigestCompactor),
            logbook: None,
            sessions: None,
            settings: RuntimeSettings::default(),
        };
        Harness { mock, bus, deps }
    }

    fn identity() -> AgentIdentity {
        AgentIdentity {
            agent_id: Some("agent-1".into()),
            name: "queen".into(),
            tier: 1,
            mission: "answer".into(),
            model_role: None,
            base_prompt: "You are a test agent.".into(),
        }
    }

    fn echo_call(text: &str) -> ToolCall {
        ToolCall::new("echo", json!({ "text": text }))
    }

    #[tokio::test]
    async fn test_iteration_cap_returns_partial_answer() {
        let h = harness(Arc::new(StaticGate(true)));
        for i in 0..3 {
            h.mock.push(
                "mock",
                Ok(ModelResponse {
                    content: format!("still working {i}"),
                    tool_calls: vec![echo_call("again")],
                    usage: None,
                }),
            );
        }
        let runtime = AgentRuntime::new(h.deps, identity());

        let outcome = runtime
            .run("loop forever", "s1", RunOptions::default().with_max_iterations(3))
            .await
            .unwrap();
        assert!(outcome.truncated);
        assert_eq!(outcome.iterations, 3);
        assert!(outcome.text.starts_with("still working 2"));
        assert!(outcome.text.contains(MAX_ITERATIONS_MARKER));
        assert_eq!(outcome.trace.len(), 3);
        assert_eq!(h.mock.attempts("mock"), 3);
    }

    #[tokio::test]
    async fn test_denied_approval_does_not_abort_run() {
        let h = harness(Arc::new(StaticGate(false)));
        h.mock.push("mock", Ok(ModelResponse::tool_calls(vec![ToolCall::new("launch", json!({}))])));
        h.mock.push("mock", Ok(ModelResponse::text("Launch was denied, stopping.")));
        let runtime = AgentRuntime::new(h.deps, identity());

        let outcome = runtime.run("launch it", "s1", RunOptions::default()).await.unwrap();
        assert_eq!(outcome.text, "Launch was denied, stopping.");
        assert!(!outcome.trace[0].ok);

        // 模型看到的是结构化的拒绝结果
        let messages = runtime.session_messages("s1").await.unwrap();
        let tool_result = messages.iter().find(|m| m.role == Role::Tool).unwrap();
        let payload: Value = serde_json::from_str(&tool_result.content).unwrap();
        assert_eq!(payload["error"], "denied");
    }

    #[tokio::test]
    async fn test_critical_failure_fails_run_and_hits_logbook() {
        let mut h = harness(Arc::new(StaticGate(true)));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let logbook = Logbook::start(Arc::clone(&db));
        h.deps.logbook = Some(Arc::clone(&logbook));
        h.mock.push("mock", Err(BackendError::server_error("boom")));
        h.mock.push("mock", Err(BackendError::server_error("boom again")));
        let mut events = h.bus.subscribe();
        let runtime = AgentRuntime::new(h.deps, identity());

        let err = runtime.run("hello", "s1", RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Router(_)));
        assert_eq!(err.kind(), ErrorKind::CriticalFailure);

        let entries = logbook.recent(10).await.unwrap();
        assert!(entries.iter().any(|e| e.event == "critical_failure"));

        let mut critical = 0;
        while let Ok(envelope) = events.try_recv() {
            if let Event::CriticalFailure { errors, .. } = envelope.event {
                critical += 1;
                assert!(errors.len() <= 3);
            }
        }
        assert_eq!(critical, 1);
    }

    #[tokio::test]
    async fn test_events_arrive_in_step_order() {
        let h = harness(Arc::new(StaticGate(true)));
        h.mock.push("mock", Ok(ModelResponse::tool_calls(vec![echo_call("a"), echo_call("b")])));
        h.mock.push("mock", Ok(ModelResponse::text("done")));
        let mut events = h.bus.subscribe();
        let runtime = AgentRuntime::new(h.deps, identity());

        let outcome = runtime.run("go", "s1", RunOptions::default()).await.unwrap();
        assert_eq!(outcome.text, "done");
        assert_eq!(
            outcome.trace.iter().map(|t| t.output.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let mut kinds = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            assert_eq!(envelope.session_id.as_deref(), Some("s1"));
            assert_eq!(envelope.agent_id.as_deref(), Some("agent-1"));
            kinds.push(match envelope.event {
                Event::StepUpdate { .. } => "step",
                Event::ToolCall { .. } => "tool_call",
                Event::ToolResult { .. } => "tool_result",
                Event::FinalAnswer { .. } => "final",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["step", "tool_call", "tool_call", "tool_result", "tool_result", "step", "final"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_context_consistent() {
        let h = harness(Arc::new(StaticGate(true)));
        let runtime = AgentRuntime::new(h.deps, identity());
        let token = CancellationToken::new();
        token.cancel();

        let err = runtime
            .run("hello", "s1", RunOptions::default().with_cancel(token))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(h.mock.total_attempts(), 0);

        // 之后可以继续同一会话
        let outcome = runtime.run("again", "s1", RunOptions::default()).await.unwrap();
        assert_eq!(outcome.text, "Echo from Mock: again");
        assert_eq!(runtime.session_messages("s1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_compaction_bounds_context() {
        let mut h = harness(Arc::new(StaticGate(true)));
        h.deps.settings = RuntimeSettings {
            max_iterations: 4,
            context_soft_limit_chars: 200,
            keep_recent_turns: 1,
        };
        let mut events = h.bus.subscribe();
        let runtime = AgentRuntime::new(h.deps, identity());

        for i in 0..6 {
            runtime
                .run(&format!("message number {i} with some padding text"), "s1", RunOptions::default())
                .await
                .unwrap();
        }
        let messages = runtime.session_messages("s1").await.unwrap();
        assert!(messages[0].summary);
        assert!(messages.len() < 12);

        let mut compacted = 0;
        while let Ok(envelope) = events.try_recv() {
            if matches!(envelope.event, Event::Compacted { .. }) {
                compacted += 1;
            }
        }
        assert!(compacted > 0);
    }

    #[tokio::test]
    async fn test_sessions_persist_and_seed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path(), 50));
        let mut h = harness(Arc::new(StaticGate(true)));
        h.deps.sessions = Some(Arc::clone(&store));
        let runtime = AgentRuntime::new(h.deps.clone(), identity());

        runtime.run("remember me", "user-1", RunOptions::default()).await.unwrap();
        runtime.run("internal", "swarm:agent-1", RunOptions::default()).await.unwrap();

        let saved = store.load_all();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "user-1");

        let restored = AgentRuntime::new(h.deps, identity());
        let (session, messages) = saved.into_iter().next().unwrap();
        assert!(restored.seed_context(&session, messages).await);
        assert!(!restored.seed_context("system:boot", vec![Message::user("x")]).await);
        let seeded = restored.session_messages("user-1").await.unwrap();
        assert_eq!(seeded[0].content, "remember me");
    }

    #[tokio::test]
    async fn test_reset_keeps_identity() {
        let h = harness(Arc::new(StaticGate(true)));
        let runtime = AgentRuntime::new(h.deps, identity());
        runtime.run("hello", "s1", RunOptions::default()).await.unwrap();
        assert!(runtime.reset_context("s1").await);
        assert!(runtime.session_messages("s1").await.unwrap().is_empty());
        assert!(runtime.system_prompt().contains("You are a test agent."));
        assert!(runtime.system_prompt().contains("- echo:"));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_tools() {
        let h = harness(Arc::new(StaticGate(true)));
        let tools = Arc::clone(&h.deps.tools);
        tools.update(|registry| {
            registry.unregister("launch");
        });
        let runtime = AgentRuntime::new(h.deps, identity());
        assert!(!runtime.system_prompt().contains("- launch:"));

        tools.update(|registry| registry.register(LaunchTool));
        assert!(!runtime.system_prompt().contains("- launch:"));
        runtime.refresh_system_prompt();
        assert!(runtime.system_prompt().contains("- launch:"));
    }
}
