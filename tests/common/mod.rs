//! Shared harness: an in-memory store, a temp redb file and the full router.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use shortly::app::{create_app, AppState};
use shortly::auth::TOKEN_FIELD;
use shortly::cache::{MemoryCache, UrlCache};
use shortly::config::{Config, LoggerMode};
use shortly::kv::Kv;
use shortly::models::BillingOption;
use shortly::storage::{SqliteStorage, Storage};
use std::sync::Arc;
use tower::ServiceExt;

pub struct TestApp {
    _dir: tempfile::TempDir,
    pub config: Config,
    pub state: Arc<AppState>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<MemoryCache>,
    pub router: Router,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }

    pub fn location(&self) -> &str {
        self.headers["location"].to_str().unwrap()
    }
}

pub async fn spawn_app(mode: LoggerMode) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::load(dir.path().join("absent.yaml")).unwrap();
    config.redirect_logger.mode = mode;
    config.server.public_base_url = None;
    config.frontend.static_dir = None;
    config.analytics.geoip_db_path = None;
    config.billing.payment = None;

    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    let storage: Arc<dyn Storage> = Arc::new(storage);
    let kv = Kv::open(dir.path().join("kv.redb")).unwrap();
    let cache = Arc::new(MemoryCache::new());

    let state = AppState::build(
        &config,
        Arc::clone(&storage),
        kv,
        cache.clone() as Arc<dyn UrlCache>,
    )
    .unwrap();
    let router = create_app(Arc::clone(&state));

    TestApp {
        _dir: dir,
        config,
        state,
        storage,
        cache,
        router,
    }
}

impl TestApp {
    /// Token for an account owner (not staff)
    pub fn owner_token(&self, account_id: i64) -> String {
        self.state.auth.issue(account_id, account_id, 0, false).unwrap()
    }

    pub async fn set_options(&self, account_id: i64, options: &[(&str, &str)]) {
        let options = options
            .iter()
            .map(|(name, value)| BillingOption::new(*name, *value))
            .collect();
        self.state
            .limiter
            .set_plan_options(account_id, options)
            .await
            .unwrap();
    }

    pub async fn option(&self, account_id: i64, name: &str) -> String {
        self.state.limiter.get_option(name, account_id).await.unwrap().value
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn call(&self, method: Method, uri: &str, token: &str) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(TOKEN_FIELD, token)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Mint through the API and return the short code
    pub async fn mint(&self, token: &str, long_url: &str) -> String {
        let response = self
            .call(
                Method::POST,
                &format!("/api/v1/urls/create?url={long_url}"),
                token,
            )
            .await;
        assert_eq!(response.status, StatusCode::OK, "{}", response.text());
        let short_url = response.json()["result"].as_str().unwrap().to_string();
        short_url.rsplit('/').next().unwrap().to_string()
    }

    /// Let the recorder finish every click handed to it so far
    pub async fn drain_clicks(&self) {
        self.state.recorder.shutdown().await;
    }
}
