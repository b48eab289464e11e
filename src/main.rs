//! # cognicode
//!
//! Code-intelligence server: rule-based analysis, refactoring and test
//! generation agents behind a cached, de-duplicating orchestrator, served
//! over HTTP and WebSocket.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cognicode_engine::{AgentFactory, EngineConfig, Orchestrator};
use cognicode_server::ServerConfig;
use cognicode_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

/// Cognicode agent server.
#[derive(Parser, Debug)]
#[command(name = "cognicode", about = "Code intelligence agent server")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Agents per operation kind. Overrides COGNICODE_POOL_SIZE.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Base log level. RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    /// Simulated inference latency per agent stage, in milliseconds.
    #[arg(long, default_value_t = 100)]
    stage_latency_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: matches!(cli.log_format, LogFormat::Json),
        ..TelemetryConfig::default()
    }));

    let mut engine = EngineConfig::from_env().context("invalid engine configuration")?;
    if let Some(size) = cli.pool_size {
        for op in cognicode_core::Operation::ALL {
            engine.pools.get_mut(op).size = size;
        }
    }

    let stage_latency = Duration::from_millis(cli.stage_latency_ms);
    let factory: AgentFactory = Arc::new(move |op, _| cognicode_agents::builtin_agent(op, stage_latency));
    let orchestrator = Orchestrator::with_metrics(engine, factory, telemetry.metrics());

    let config = ServerConfig {
        host: cli.host,
        port: cli.port,
        ..ServerConfig::default()
    };
    let handle = cognicode_server::start(config, orchestrator.clone(), Some(telemetry))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "cognicode ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    handle.stop().await;
    Ok(())
}
