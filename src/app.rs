//! Shared application state and the assembled HTTP router.

use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::analytics::{ClickRecorder, GeoIpService};
use crate::api;
use crate::auth::AuthService;
use crate::billing::Limiter;
use crate::cache::UrlCache;
use crate::config::{Config, LoggerMode};
use crate::kv::Kv;
use crate::links::LinkService;
use crate::queue::{ClickPublisher, ClickQueue, QueuePublisher, SyncPublisher};
use crate::redirect;
use crate::storage::Storage;
use crate::timeseries::TimeSeries;

pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn UrlCache>,
    pub links: LinkService,
    pub limiter: Limiter,
    pub timeseries: TimeSeries,
    pub auth: Arc<AuthService>,
    pub recorder: Arc<ClickRecorder>,
    pub public_base_url: Option<String>,
    pub static_dir: Option<String>,
}

impl AppState {
    /// Wire the services on top of already opened stores. Spawns the click
    /// recorder, so it must run inside a tokio runtime.
    pub fn build(
        config: &Config,
        storage: Arc<dyn Storage>,
        kv: Kv,
        cache: Arc<dyn UrlCache>,
    ) -> Result<Arc<Self>> {
        let limiter = Limiter::new(kv.clone(), Arc::clone(&storage), &config.billing.default_plan);
        let timeseries = TimeSeries::new(kv, limiter.clone());
        let links = LinkService::new(
            Arc::clone(&storage),
            Arc::clone(&cache),
            limiter.clone(),
            timeseries.clone(),
            Duration::from_secs(config.cache.miss_ttl_secs),
            config.cache.miss_capacity,
        );

        let publisher: Arc<dyn ClickPublisher> = match config.redirect_logger.mode {
            LoggerMode::Queue => {
                info!(queue = %config.redirect_logger.queue, "clicks go through the durable queue");
                Arc::new(QueuePublisher::new(ClickQueue::new(
                    Arc::clone(&storage),
                    &config.redirect_logger,
                )))
            }
            LoggerMode::Sync => {
                info!("clicks are written straight to the click log");
                Arc::new(SyncPublisher::new(Arc::clone(&storage)))
            }
        };

        let geoip = match &config.analytics.geoip_db_path {
            Some(path) => {
                info!(path = %path, "GeoIP country lookup enabled");
                Some(GeoIpService::open(path)?)
            }
            None => None,
        };

        let recorder = ClickRecorder::spawn(
            timeseries.clone(),
            publisher,
            geoip,
            config.redirect_logger.buffer_size,
        );

        Ok(Arc::new(Self {
            auth: Arc::new(AuthService::new(&config.auth, Arc::clone(&storage))),
            storage,
            cache,
            links,
            limiter,
            timeseries,
            recorder: Arc::new(recorder),
            public_base_url: config.server.public_base_url.clone(),
            static_dir: config.frontend.static_dir.clone(),
        }))
    }
}

/// Admin API, health, static assets and the catch-all redirect
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::create_api_router(Arc::clone(&state)))
        .merge(redirect::create_redirect_router(state))
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
