//! src/main.rs
//!
//! Binary entry point. Responsible for initializing tracing, loading
//! configuration, instantiating the main `App`, and running it.

use anyhow::Context;
use membership_core::{App, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;

    if let Err(e) = App::new(config)?.run().await {
        tracing::error!(error = %e, "application failed");
        std::process::exit(1);
    }

    Ok(())
}
