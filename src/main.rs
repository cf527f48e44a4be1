//! HL7 Engine - Main Entry Point
//!
//! Loads the engine settings, deploys every enabled channel and runs until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use hl7_engine::{
    config::EngineConfig,
    manager::ChannelManager,
    scripting::{GlobalMaps, RhaiExecutor},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Minimal clinical integration engine
#[derive(Parser, Debug)]
#[command(name = "hl7-engine", version, about)]
struct Cli {
    /// Engine settings file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log received frames and replies
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,hl7_engine=debug"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hl7-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_or_default(cli.config.as_deref()).context("Failed to load engine config")?;
    // Flushes the log file on drop
    let _guard = init_logging(config.log_dir.as_deref());

    tracing::info!("Starting HL7 engine");

    let channels = config.load_channels().context("Failed to load channel definitions")?;
    let executor = Arc::new(RhaiExecutor::with_limits(config.sandbox.clone()));
    let manager = ChannelManager::new(GlobalMaps::new(), executor);
    manager.set_debug(config.debug_mode || cli.debug).await;

    for channel in channels {
        manager.add_channel(channel);
    }

    let results = manager.deploy_all().await;
    let deployed = results.iter().filter(|(_, r)| r.is_ok()).count();
    tracing::info!(deployed, failed = results.len() - deployed, "Channels deployed");
    for (id, result) in &results {
        if let Ok(Some(addr)) = result {
            tracing::info!(channel = %id, %addr, "Listening");
        }
    }

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;

    tracing::info!("Shutting down...");
    manager.undeploy_all().await;

    Ok(())
}
