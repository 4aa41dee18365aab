// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use sl_config::SiteLedgerConfig;
use sl_daemon::{AppState, build_app, spawn_background};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sl-daemon", version, about = "SiteLedger expense pipeline daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("sl=debug,sl_daemon=debug,tower_http=info")
    } else {
        EnvFilter::new("sl=info,sl_daemon=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = SiteLedgerConfig::from_env().context("load configuration")?;
    for warning in config.warnings() {
        warn!(%warning, "configuration warning");
    }

    let state = AppState::build(config);
    let background = spawn_background(std::sync::Arc::clone(&state));

    let app = build_app(std::sync::Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "sl-daemon listening");

    axum::serve(listener, app).await.context("serve")?;
    background.abort();
    Ok(())
}
