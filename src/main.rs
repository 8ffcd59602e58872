//! Matrix Media Store - Entry Point
//!
//! Usage: `matrix-media-store [CONFIG_PATH]`. Without a path the server
//! reads `config.local.toml` or `config.toml` from the working directory.

use matrix_media_store::{
    config::{Config, LoggingConfig},
    run,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load(&path)?,
        None => Config::load_default()?,
    };

    init_logging(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = ?config.storage.provider,
        server_name = %config.server.server_name,
        "Starting Matrix Media Store"
    );

    run(config).await
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let output = match config.format.as_str() {
        "json" => fmt::layer().json().boxed(),
        "pretty" => fmt::layer().pretty().boxed(),
        other => anyhow::bail!("unknown log format {:?} (expected pretty or json)", other),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()?;

    Ok(())
}
