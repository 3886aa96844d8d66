// src/main.rs

//! The main entry point for the steward coordinator.

use anyhow::Result;
use std::env;
use steward::config::Config;
use steward::server;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("steward version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise it defaults to "steward.toml". A missing default file
    // is fine: the coordinator then runs on built-in defaults.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None => match Config::from_file("steward.toml") {
            Ok(cfg) => cfg,
            Err(_) => Config::default(),
        },
    };

    // Initialize logging. RUST_LOG wins over the configured filter.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    // Generate a unique 40-character hexadecimal run ID for this coordinator
    // instance. It shows up in the banner and in subscriber greetings so that
    // restarts are visible to observers.
    let mut runid_bytes = [0u8; 20];
    getrandom::fill(&mut runid_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to generate random run ID: {}", e))?;
    let run_id = hex::encode(runid_bytes);

    info!(
        "Steward {} starting on {}:{} (run id {})",
        VERSION, config.host, config.port, run_id
    );

    if let Err(e) = server::run(config, run_id).await {
        error!("Coordinator runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
