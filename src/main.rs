use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shortly::app::{create_app, shutdown_signal, AppState};
use shortly::billing::{build_checker, Reconciler};
use shortly::config::{Config, DEFAULT_CONFIG_PATH};
use shortly::kv::Kv;
use shortly::persister::{self, Persister};
use shortly::queue::ClickQueue;
use shortly::{cache, storage};

#[derive(Parser)]
#[command(name = "shortly", about = "URL shortener with click analytics")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Listen port, overrides the configured one
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!("Loaded configuration");

    let storage = storage::connect(&config.database).await?;
    info!("Database initialized successfully");

    let kv = Kv::open(&config.kv.path)?;
    let cache = cache::build(&config.cache, &kv)?;
    if config.cache.warm_up {
        match cache::warm_up(cache.as_ref(), storage.as_ref()).await {
            Ok(count) => info!(count, cache = cache.name(), "🔥 cache warmed up"),
            Err(err) => error!(error = %err, "cache warm-up failed"),
        }
    }

    let state = AppState::build(&config, Arc::clone(&storage), kv, Arc::clone(&cache))?;
    let loaded = state.limiter.load_all().await?;
    info!(accounts = loaded, "billing options loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        Arc::clone(&storage),
        state.limiter.clone(),
        build_checker(&config.billing)?,
        &config.billing,
    )
    .spawn(shutdown_rx.clone());

    let persister = if config.redirect_logger.consume_in_process {
        info!("click persister running in process");
        let queue = ClickQueue::new(Arc::clone(&storage), &config.redirect_logger);
        Some(persister::spawn(
            Persister::new(queue, Arc::clone(&storage), &config.persister),
            shutdown_rx.clone(),
            Duration::from_secs(config.persister.shutdown_grace_secs),
        ))
    } else {
        None
    };

    let app = create_app(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 shortly listening on http://{}", addr);
    info!("   - API endpoints available at http://{}/api/v1/...", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.recorder.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = reconciler.await {
        error!(error = %err, "reconciler task failed");
    }
    match persister {
        // the persister closes the store once drained
        Some(handle) => {
            if let Err(err) = handle.await {
                error!(error = %err, "click persister task failed");
            }
        }
        None => storage.close().await,
    }

    info!("👋 shortly stopped");
    Ok(())
}
