//! Library entrypoint for textogether-relay so tests and other binaries can
//! embed the relay without shelling out.

pub mod cli;
pub mod config;
pub mod ratelimit;
pub mod server;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;

pub fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Run the relay using CLI args (parsed by the caller).
pub async fn run_with_cli(cli: cli::Cli) -> Result<()> {
    init_tracing(cli.verbose)?;
    let config = RelayConfig::from_cli(&cli)?;
    server::serve(config).await
}
