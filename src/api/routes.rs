use axum::{
    extract::{Path, State},
    middleware,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use super::analytics::{campaign_data, clicks_data, clicks_total, link_stat};
use super::handlers::{create_link, hide_link, list_links, list_urls, mint_url, remove_url};
use super::health::health_check;
use super::static_files::serve_static;
use crate::app::AppState;
use crate::auth::{permissions, require_permission, RequirePermission};

/// Routes sharing one permission
fn guarded(
    state: &Arc<AppState>,
    permission: &'static str,
    routes: Router<Arc<AppState>>,
) -> Router<Arc<AppState>> {
    let guard = RequirePermission {
        auth: Arc::clone(&state.auth),
        permission,
    };
    routes.route_layer(middleware::from_fn_with_state(guard, require_permission))
}

async fn static_asset(State(state): State<Arc<AppState>>, Path(path): Path<String>) -> Response {
    serve_static(&path, state.static_dir.as_deref()).await
}

pub fn create_api_router(state: Arc<AppState>) -> Router {
    let write = Router::new()
        .route("/urls/create", post(mint_url))
        .route("/urls/remove", delete(remove_url))
        .route("/users/links", post(create_link))
        .route("/users/links/{code}/hide", post(hide_link));

    let read = Router::new()
        .route("/urls", get(list_urls))
        .route("/users/links", get(list_links));

    let stats = Router::new()
        .route("/users/links/clicks/total", get(clicks_total))
        .route("/users/links/clicks/data", get(clicks_data))
        .route("/users/links/{code}/stat", get(link_stat));

    let campaigns = Router::new().route("/campaigns/data", get(campaign_data));

    let v1 = Router::new()
        .merge(guarded(&state, permissions::LINKS_WRITE, write))
        .merge(guarded(&state, permissions::LINKS_READ, read))
        .merge(guarded(&state, permissions::STATS_READ, stats))
        .merge(guarded(&state, permissions::CAMPAIGNS_READ, campaigns));

    Router::new()
        .route("/health", get(health_check))
        .route("/static/{*path}", get(static_asset))
        .nest("/api/v1", v1)
        .with_state(state)
}
