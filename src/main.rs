//! LLM Dispatch
//!
//! HTTP front for the dispatch layer: routes text-generation requests across
//! pooled backends with circuit breaking, calibrated timeouts and failover.

use anyhow::{Context, Result};
use clap::Parser;
use llm_dispatch::{
    config::{Environment, Settings},
    logging::init_tracing,
    server::App,
};
use std::path::PathBuf;

/// LLM Dispatch
///
/// Dispatch and resilience layer for pooled AI backends.
#[derive(Parser, Debug)]
#[command(name = "llm-dispatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML or JSON); DISPATCH__* variables override it
    #[arg(short, long, env = "DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    /// Environment: dev, staging, prod
    #[arg(short, long)]
    env: Option<Environment>,

    /// Log file path for JSON logs (enables file logging with 10MB rotation)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (before logging, so we can use log_level)
    let mut settings = Settings::load(args.config.as_deref())?;

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(env) = args.env {
        settings.environment = env;
    }
    if let Some(log_file) = args.log_file {
        settings.log_file = Some(log_file);
    }
    settings.validate().context("Invalid configuration")?;

    init_tracing(&settings.log_level, settings.log_file.as_deref())
        .context("Failed to initialize logging")?;

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        environment = %settings.environment,
        host = %settings.host,
        port = %settings.port,
        backends = settings.backends.len(),
        "Starting application"
    );

    let app = App::new(settings)?;
    app.run_with_graceful_shutdown().await?;

    tracing::info!("Application shutdown complete");
    Ok(())
}
