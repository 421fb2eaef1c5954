//! ddmsd
//!
//! Runs the DDMS services until interrupted.

use clap::Parser;
use ddms_service::{Collaborators, ServiceConfig, Services};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Distributed data management daemon.
#[derive(Parser)]
#[command(name = "ddmsd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of the metadata journals
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    let collaborators = Collaborators::standalone(&config);
    let services = Services::build(&config, collaborators)?;
    info!("ddmsd v{} running, press Ctrl-C to stop", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())?;

    info!("shutting down");
    services.shutdown();
    Ok(())
}
