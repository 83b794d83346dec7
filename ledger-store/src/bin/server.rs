//! Ledger daemon: opens the store and runs reconciliation until ctrl-c

use anyhow::Context;
use ledger_store::{Config, Ledger, SessionDirectory};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if std::env::var("LEDGER_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load configuration
    let config = match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        Err(_) => Config::from_env().context("Invalid LEDGER_* environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        backend = %config.storage.kind,
        "Starting ledger daemon"
    );

    let sessions = Arc::new(SessionDirectory::new());
    let ledger = Ledger::open(config, sessions).await?;
    tracing::info!(
        primary = %ledger.primary_currency().id,
        "Ledger opened successfully"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger daemon");
    ledger.shutdown().await?;
    Ok(())
}
