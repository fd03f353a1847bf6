use axum::{
    extract::{Path, State},
    http::{
        header::{self, HeaderMap, HeaderValue},
        StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analytics::{extract_client_ip, headers_map, Click};
use crate::api::static_files;
use crate::app::AppState;
use crate::links::with_scheme;
use crate::minter::is_valid_code;

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn bad_url() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "url has incorrect format" })),
    )
        .into_response()
}

/// GET /
pub async fn landing(State(state): State<Arc<AppState>>) -> Response {
    static_files::landing(state.static_dir.as_deref()).await
}

/// GET /{code}
///
/// Answers 303 to the stored long URL (with `https://` prefixed when it
/// names no scheme). The click is handed off to the recorder and never
/// delays or fails the redirect.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_valid_code(&code) {
        return not_found();
    }

    let long_url = match state.links.resolve(&code).await {
        Ok(Some(long_url)) => long_url,
        Ok(None) => {
            debug!(short_code = %code, "unknown short code");
            return not_found();
        }
        Err(err) => {
            warn!(short_code = %code, error = %err, "lookup failed");
            return not_found();
        }
    };

    let target = with_scheme(&long_url).into_owned();
    if url::Url::parse(&target).is_err() {
        warn!(short_code = %code, long_url = %long_url, "stored url does not parse");
        return bad_url();
    }
    let Ok(location) = HeaderValue::from_str(&target) else {
        return bad_url();
    };

    let referer = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.recorder.record(Click {
        short_code: code,
        long_url,
        ip: extract_client_ip(&headers),
        referer,
        headers: headers_map(&headers),
        observed_at: chrono::Utc::now().timestamp(),
    });

    (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response()
}
