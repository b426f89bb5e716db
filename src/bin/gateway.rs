//! Hive Gateway - WebSocket 控制面
//!
//! 运行方式：
//! ```bash
//! cargo run --bin hive-gateway --features gateway
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{Kernel, ShutdownManager};
use hive::gateway::{ControlPlane, GatewayServer};
use hive::llm::default_backends;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    let bind_addr = std::env::var("HIVE_GATEWAY_BIND").unwrap_or_else(|_| config.gateway.bind.clone());

    let backends = default_backends(
        config.router.base_url.as_deref(),
        config.router.resolved_api_key().as_deref(),
        config.router.request_timeout(),
    );
    let kernel = Kernel::boot(config, backends).await.context("Failed to boot kernel")?;
    kernel.spawn_sweeper().await;

    let signals = Arc::new(ShutdownManager::new());
    signals.install_signal_handlers();

    let server = GatewayServer::new(Arc::new(ControlPlane::new(Arc::clone(&kernel))), bind_addr);
    server.run(signals.token()).await?;

    kernel.shutdown().await;
    Ok(())
}
