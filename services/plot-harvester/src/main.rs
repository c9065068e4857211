// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Plot Harvester Service
//!
//! Pulls finished plots from remote farmers onto local volumes. It:
//!
//! - Polls every farmer for plots on a fixed tick
//! - Reserves a volume with room (evicting older plots if needed)
//! - Downloads, verifies and commits one plot per farmer at a time
//! - Optionally validates each plot with the chia CLI
//! - Tells the farmer to delete its copy once the plot is safe
//! - Serves status and metrics over HTTP

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use dropshot::{ConfigDropshot, ConfigLogging, ConfigLoggingLevel, HttpServerStarter};
use tokio::sync::watch;
use tracing::info;

use plot_harvester::PlotHarvesterImpl;
use plot_harvester::config::{DEFAULT_CONFIG_FILE, HarvesterConfig};
use plot_harvester::context::{ApiContext, HarvestContext};
use plot_harvester::metrics;

/// Default bind address for the status server.
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8979";

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_version();
                println!("Usage: {} [OPTIONS]", args[0]);
                println!();
                println!("Options:");
                println!("  -h, --help       Display this information");
                println!("  -V, --version    Display the program's version number");
                println!();
                println!("Environment variables:");
                println!(
                    "  CONFIG_FILE      Path to JSON config file (default: {})",
                    DEFAULT_CONFIG_FILE
                );
                println!(
                    "  BIND_ADDRESS     Status server bind address (default: {})",
                    DEFAULT_BIND_ADDRESS
                );
                println!(
                    "  RUST_LOG         Log filter (default: plot_harvester=info,dropshot=info)"
                );
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "plot_harvester=info,dropshot=info".to_string()),
        ))
        .init();

    print_version();

    // Load configuration
    let config_path = PathBuf::from(
        std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string()),
    );
    let config = HarvesterConfig::from_file(&config_path).await?;
    info!(
        config = %config_path.display(),
        volumes_root = %config.volumes_root.display(),
        sources = config.sources.len(),
        validation = config.chia_dir.is_some(),
        "Loaded configuration"
    );

    metrics::register_metrics();

    let harvest = HarvestContext::new(config).context("Failed to create harvest context")?;
    let orchestrator = Arc::new(harvest.build_orchestrator());

    // Start the scheduler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    // Get API description from the trait implementation
    let api = harvester_api::harvester_api_mod::api_description::<PlotHarvesterImpl>()
        .map_err(|e| anyhow::anyhow!("Failed to create API description: {}", e))?;

    // Configure the server
    let bind_address = std::env::var("BIND_ADDRESS")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string())
        .parse()
        .context("Invalid BIND_ADDRESS")?;

    let config_dropshot = ConfigDropshot {
        bind_address,
        default_handler_task_mode: dropshot::HandlerTaskMode::Detached,
        ..Default::default()
    };

    let config_logging = ConfigLogging::StderrTerminal {
        level: ConfigLoggingLevel::Info,
    };

    let log = config_logging
        .to_logger("plot-harvester")
        .map_err(|error| anyhow::anyhow!("failed to create logger: {}", error))?;

    // Start the server
    let server = HttpServerStarter::new(
        &config_dropshot,
        api,
        ApiContext::new(Arc::clone(&orchestrator)),
        &log,
    )
    .map_err(|error| anyhow::anyhow!("failed to create server: {}", error))?
    .start();

    info!("Plot harvester status on http://{}", bind_address);

    tokio::select! {
        result = server => {
            result.map_err(|error| anyhow::anyhow!("server failed: {}", error))?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
    }

    // In-flight transfers are never cancelled; wait for them
    let _ = shutdown_tx.send(true);
    let outcomes = scheduler.await.context("Scheduler task failed")?;
    info!(finished = outcomes.len(), "Plot harvester stopped");

    Ok(())
}
