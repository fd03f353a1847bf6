use axum::{routing::get, Router};
use std::sync::Arc;

use super::handlers::{landing, redirect};
use crate::app::AppState;

pub fn create_redirect_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/{code}", get(redirect))
        .with_state(state)
}
