use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::app::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub errors: Vec<String>,
}

async fn check<F, E>(name: &str, probe: F) -> Option<String>
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(CHECK_TIMEOUT, probe).await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{name}: {err}")),
        Err(_) => Some(format!("{name}: timed out")),
    }
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (storage, cache) = tokio::join!(
        check("storage", state.storage.ping()),
        check(state.cache.name(), state.cache.ping()),
    );
    let errors: Vec<String> = [storage, cache].into_iter().flatten().collect();

    if errors.is_empty() {
        let report = HealthReport {
            status: "healthy",
            errors,
        };
        (StatusCode::OK, Json(report))
    } else {
        warn!(?errors, "health check failed");
        let report = HealthReport {
            status: "unhealthy",
            errors,
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(report))
    }
}
