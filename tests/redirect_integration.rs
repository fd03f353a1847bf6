//! Redirect path: cache hits, read-through, scheme fixing and click hand-off.

mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use common::spawn_app;
use shortly::cache::UrlCache;
use shortly::config::LoggerMode;
use shortly::models::ClickEvent;
use shortly::queue::ClickQueue;
use std::time::Duration;

#[tokio::test]
async fn test_hot_redirect_publishes_click() {
    let app = spawn_app(LoggerMode::Queue).await;
    app.cache.store("abc12", "https://ex.com/p").await.unwrap();

    let response = app.get("/abc12").await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    assert_eq!(response.location(), "https://ex.com/p");

    app.drain_clicks().await;
    let queue = ClickQueue::new(app.storage.clone(), &app.config.redirect_logger);
    assert_eq!(queue.depth().await.unwrap(), 1);

    let batch = queue.consume(10, Duration::from_millis(200)).await.unwrap();
    assert_eq!(batch.len(), 1);
    let event: ClickEvent = serde_json::from_str(&batch[0].payload).unwrap();
    assert_eq!(event.short_code, "abc12");
    assert_eq!(event.long_url, "https://ex.com/p");
}

#[tokio::test]
async fn test_scheme_is_added() {
    let app = spawn_app(LoggerMode::Sync).await;
    app.cache.store("ab", "ex.com").await.unwrap();

    let response = app.get("/ab").await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    assert_eq!(response.location(), "https://ex.com");
}

#[tokio::test]
async fn test_unknown_code_is_not_found() {
    let app = spawn_app(LoggerMode::Sync).await;

    let response = app.get("/zzzzz").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.text(), "not found");

    let response = app.get("/no-such.code").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unparseable_stored_url() {
    let app = spawn_app(LoggerMode::Sync).await;
    app.cache.store("bad01", "http://[::1").await.unwrap();

    let response = app.get("/bad01").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "url has incorrect format");
}

#[tokio::test]
async fn test_cold_link_is_read_through() {
    let app = spawn_app(LoggerMode::Sync).await;
    app.storage
        .create_link(1, "cold1", "https://ex.com/cold", None)
        .await
        .unwrap();

    let response = app.get("/cold1").await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    assert_eq!(response.location(), "https://ex.com/cold");
    assert_eq!(
        app.cache.load("cold1").await.unwrap().as_deref(),
        Some("https://ex.com/cold")
    );
}

#[tokio::test]
async fn test_mint_redirect_delete_round_trip() {
    let app = spawn_app(LoggerMode::Sync).await;
    app.set_options(1, &[("url_limit", "5"), ("timedata_limit", "31")])
        .await;
    let token = app.owner_token(1);

    let code = app.mint(&token, "example.com").await;
    let response = app.get(&format!("/{code}")).await;
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    let location = url::Url::parse(response.location()).unwrap();
    assert_eq!(location.as_str(), "https://example.com/");

    let removed = app
        .call(
            Method::DELETE,
            &format!("/api/v1/urls/remove?url={code}"),
            &token,
        )
        .await;
    assert_eq!(removed.status, StatusCode::OK);
    assert_eq!(removed.json()["result"], "removed");

    assert_eq!(app.get(&format!("/{code}")).await.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_click_reaches_log_and_stats() {
    let app = spawn_app(LoggerMode::Sync).await;
    app.set_options(1, &[("url_limit", "5"), ("timedata_limit", "31")])
        .await;
    let token = app.owner_token(1);
    let code = app.mint(&token, "https://example.com/landing").await;

    let request = Request::builder()
        .uri(format!("/{code}"))
        .header("x-forwarded-for", "10.0.0.1, 8.8.8.8")
        .header("referer", "https://news.example")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(request).await.status, StatusCode::SEE_OTHER);
    app.drain_clicks().await;

    let breakdown = app.storage.link_breakdown(&code, 0, i64::MAX).await.unwrap();
    assert_eq!(breakdown.len(), 1);
    assert_eq!(breakdown[0].referer, "https://news.example");
    assert_eq!(breakdown[0].count, 1);

    let total = app
        .call(Method::GET, "/api/v1/users/links/clicks/total", &token)
        .await;
    assert_eq!(total.json()["result"], 1);

    let stat = app
        .call(Method::GET, &format!("/api/v1/users/links/{code}/stat"), &token)
        .await;
    assert_eq!(stat.status, StatusCode::OK, "{}", stat.text());
    let stat = stat.json();
    let clicks = &stat["result"]["clicks"];
    assert_eq!(clicks["labels"].as_array().unwrap().len(), 31);
    let per_day: u64 = clicks["datasets"][0]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|count| count.as_u64().unwrap())
        .sum();
    assert_eq!(per_day, 1);
    assert_eq!(stat["result"]["referrers"]["labels"][0], "https://news.example");

    let hourly = app
        .call(Method::GET, "/api/v1/users/links/clicks/data", &token)
        .await
        .json();
    assert_eq!(hourly["result"]["labels"].as_array().unwrap().len(), 24);
    assert_eq!(hourly["result"]["labels"][0], "00:00");
}

#[tokio::test]
async fn test_landing_page() {
    let app = spawn_app(LoggerMode::Sync).await;

    let response = app.get("/").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.text().contains("shortly"));

    let css = app.get("/static/site.css").await;
    assert_eq!(css.status, StatusCode::OK);
    assert_eq!(css.headers["content-type"], "text/css");
}
