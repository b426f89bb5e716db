//! Hive - 终端前端
//!
//! 从 stdin 逐行读取输入交给根 Agent，输出最终回答或简短诊断（`error[kind]: message`）。
//! 命令：/approve <id>、/deny <id>、/agents、/graveyard、/reset、/quit。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{run_with_graceful_shutdown, Event, Kernel, ShutdownManager, ShutdownReason, SubmitOptions};
use hive::gateway::{ControlPlane, ControlRequest, ErrorPayload, InboundFrame};
use hive::llm::default_backends;
use tokio::io::{AsyncBufReadExt, BufReader};

const SESSION_ID: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init_with_default("warn");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let backends = default_backends(
        config.router.base_url.as_deref(),
        config.router.resolved_api_key().as_deref(),
        config.router.request_timeout(),
    );
    let kernel = Kernel::boot(config, backends).await.context("Failed to boot kernel")?;
    kernel.spawn_sweeper().await;

    let status = kernel.router_status();
    println!(
        "hive ready: root {} ({:?}, {} reachable models). Type /quit to exit.",
        kernel.root().name,
        status.mode,
        status.reachable.len()
    );

    let signals = Arc::new(ShutdownManager::new());
    let control = Arc::new(ControlPlane::new(Arc::clone(&kernel)));
    spawn_event_printer(&kernel);

    let app = repl(Arc::clone(&control), Arc::clone(&signals));
    let cleanup_kernel = Arc::clone(&kernel);
    run_with_graceful_shutdown(signals, app, || async move {
        cleanup_kernel.shutdown().await;
    })
    .await;
    Ok(())
}

/// 打印需要用户关注的事件：审批请求、输入请求、临界失败
fn spawn_event_printer(kernel: &Arc<Kernel>) {
    let mut events = kernel.bus().subscribe();
    tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            match envelope.event {
                Event::ApprovalRequest { id, kind, description } => {
                    println!("[approval {}] {}: {}  (/approve {} or /deny {})", id, kind, description, id, id);
                }
                Event::InputRequest { id, prompt } => {
                    println!("[input {}] {}", id, prompt);
                }
                Event::CriticalFailure { label, errors } => {
                    println!("[critical] {}: {}", label, errors.join("; "));
                }
                Event::AgentSpawned { name, tier, .. } => {
                    println!("[swarm] spawned {} (tier {})", name, tier);
                }
                Event::AgentTerminated { agent_id, reason } => {
                    println!("[swarm] terminated {} ({})", agent_id, reason);
                }
                _ => {}
            }
        }
    });
}

async fn repl(control: Arc<ControlPlane>, signals: Arc<ShutdownManager>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            if !run_command(&control, command).await {
                signals.shutdown(ShutdownReason::Requested);
                break;
            }
            continue;
        }

        // 在独立任务里运行，等待审批期间仍能读取 /approve
        let kernel = Arc::clone(control.kernel());
        let input = line.to_string();
        tokio::spawn(async move {
            match kernel.submit(SESSION_ID, &input, SubmitOptions::default()).await {
                Ok(outcome) => println!("{}", outcome.text),
                Err(e) => println!("{}", ErrorPayload::from(e).diagnostic()),
            }
        });
    }
}

/// 返回 false 表示退出
async fn run_command(control: &ControlPlane, command: &str) -> bool {
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::to_string);

    let result = match (name, arg) {
        ("quit" | "exit", _) => return false,
        ("approve", Some(id)) => frame(control, InboundFrame::ApprovalResponse { id, approved: true }).await,
        ("deny", Some(id)) => frame(control, InboundFrame::ApprovalResponse { id, approved: false }).await,
        ("agents", _) => control.execute(ControlRequest::ListAgents).await,
        ("graveyard", _) => control.execute(ControlRequest::ListGraveyard).await,
        ("reset", _) => Ok(serde_json::json!({ "reset": control.kernel().reset_session(SESSION_ID).await })),
        _ => {
            println!("commands: /approve <id>, /deny <id>, /agents, /graveyard, /reset, /quit");
            return true;
        }
    };
    match result {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default()),
        Err(e) => println!("{}", e.diagnostic()),
    }
    true
}

async fn frame(control: &ControlPlane, frame: InboundFrame) -> Result<serde_json::Value, ErrorPayload> {
    match control.handle_frame(frame).await {
        hive::gateway::FrameReply::Ack { data, .. } => Ok(data),
        hive::gateway::FrameReply::Error { error, .. } => Err(error),
        other => Ok(serde_json::to_value(&other).unwrap_or_default()),
    }
}
