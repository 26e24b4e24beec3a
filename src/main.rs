// src/main.rs

//! The main entry point for the replgate cluster monitor.

use anyhow::Result;
use replgate::config::Config;
use replgate::server;
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("replgate version {VERSION}");
        return Ok(());
    }

    // The configuration path can be given with --config; it defaults to "replgate.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("replgate.toml");

    // The monitors cannot run without a valid configuration.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level. Monitor modules default to debug so state
    // transitions and probe failures are visible.
    let log_level = env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("{},replgate::core::monitor=debug", config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting replgate {}...", VERSION);

    if let Err(e) = server::run(config).await {
        error!("Runtime error: {}", e);
        return Err(e);
    }
    Ok(())
}
