use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shortly::app::shutdown_signal;
use shortly::config::{Config, DEFAULT_CONFIG_PATH};
use shortly::persister::{self, Persister};
use shortly::queue::ClickQueue;
use shortly::storage;

/// Moves click events from the durable queue into the click log
#[derive(Parser)]
#[command(name = "logsaver")]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let storage = storage::connect(&config.database).await?;

    let queue = ClickQueue::new(std::sync::Arc::clone(&storage), &config.redirect_logger);
    info!(queue = queue.name(), "📥 consuming click events");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = persister::spawn(
        Persister::new(queue, storage, &config.persister),
        shutdown_rx,
        Duration::from_secs(config.persister.shutdown_grace_secs),
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = handle.await {
        error!(error = %err, "click persister task failed");
    }

    info!("logsaver stopped");
    Ok(())
}
