use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use mime_guess::from_path;
use rust_embed::RustEmbed;
use std::path::{Component, Path};

#[derive(RustEmbed)]
#[folder = "static/"]
pub struct Assets;

const LANDING: &str = "index.html";

fn respond(path: &str, data: impl Into<Body>) -> Response {
    let mime = from_path(path).first_or_octet_stream();
    let body: Body = data.into();
    ([(header::CONTENT_TYPE, mime.as_ref().to_string())], body).into_response()
}

/// Only plain relative paths are looked up on disk
fn is_safe(path: &str) -> bool {
    Path::new(path)
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
}

/// Serve `path` from `static_dir` when configured, else from the assets
/// compiled into the binary.
pub async fn serve_static(path: &str, static_dir: Option<&str>) -> Response {
    let path = path.trim_start_matches('/');
    let path = if path.is_empty() { LANDING } else { path };
    if !is_safe(path) {
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(dir) = static_dir {
        if let Ok(content) = tokio::fs::read(Path::new(dir).join(path)).await {
            return respond(path, content);
        }
    }

    match Assets::get(path) {
        Some(content) => respond(path, content.data.into_owned()),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// The landing document
pub async fn landing(static_dir: Option<&str>) -> Response {
    serve_static(LANDING, static_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_traversal() {
        assert!(is_safe("css/site.css"));
        assert!(!is_safe("../Cargo.toml"));
        assert!(!is_safe("/etc/passwd"));
    }

    #[tokio::test]
    async fn test_landing_is_embedded() {
        let response = landing(None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/html"
        );
    }

    #[tokio::test]
    async fn test_filesystem_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>local</p>").unwrap();

        let response = landing(dir.path().to_str()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<p>local</p>");

        let missing = serve_static("nope.js", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
