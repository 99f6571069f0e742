//! Mirror Agent - Main entry point
//!
//! Mirrors a local application data directory into a shared folder.

use anyhow::Result;
use clap::Parser;
use mirror_agent::{config::Config, daemon, utils};
use mirror_engine::LogBuffer;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Run a single sync attempt and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = dotenvy::dotenv();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.api.port = port;
    }

    // Initialize logging
    let logs = LogBuffer::new(config.log.capacity);
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, logs.clone())?;

    config.validate()?;
    let components = daemon::Components::build(&config)?;

    tracing::info!(
        "Starting mirror-agent v{} (machine: {})",
        env!("CARGO_PKG_VERSION"),
        components.orchestrator.machine()
    );
    tracing::info!(
        "Mirroring {} into {}",
        config.paths.source.display(),
        config.paths.shared_root.display()
    );

    if args.once {
        daemon::run_once(&components).await?;
        return Ok(());
    }

    daemon::run(&config, components, logs).await?;
    Ok(())
}
