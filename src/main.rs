//! Tab Bridge Relay - 中继服务器
//!
//! 运行方式：
//! ```bash
//! cargo run --bin tab-bridge -- [config.toml]
//! ```

use std::path::PathBuf;

use anyhow::Context;
use tab_bridge::config::load_config;
use tab_bridge::gateway::RelayBroker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tab_bridge::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Default::default()
        }
    };

    let broker = RelayBroker::new(cfg.relay.to_relay_config());
    broker.start().await.context("Failed to start relay")?;
    tracing::info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down relay...");
    broker.stop().await;

    Ok(())
}
