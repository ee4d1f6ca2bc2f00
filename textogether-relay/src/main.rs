//! textogether-relay: fans frames out to the other subscribers of a topic.

use anyhow::Result;
use clap::Parser;

use textogether_relay::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    textogether_relay::run_with_cli(Cli::parse()).await
}
