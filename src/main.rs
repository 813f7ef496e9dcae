//! docflow CLI entrypoint

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docflow::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins, then LOG_LEVEL, then info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match std::env::var("LOG_LEVEL") {
            Ok(level) if !level.trim().is_empty() => EnvFilter::try_new(level.trim().to_lowercase()),
            _ => Ok(EnvFilter::new("info")),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    cli.execute().await
}
