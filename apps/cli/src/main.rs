//! oppscout CLI: aggregate, deduplicate and score funding opportunities.
//!
//! Runs every configured source, scores the results against the
//! organization's capability profile, and reports what is relevant and new.

mod commands;
mod progress;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
