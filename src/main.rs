mod choke;
mod cli;
mod config;
mod coordinator;
mod error;
mod eventlog;
mod peer;
mod piece;
mod storage;

use anyhow::{Context, Result};
use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Parse CLI arguments and run
    let cli = Cli::parse();
    cli.run().await.context("peer process failed")?;

    Ok(())
}
