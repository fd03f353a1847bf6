//! Queue mode end to end: the server enqueues clicks, a persister (as run by
//! `logsaver`) moves them into the click log.

mod common;

use axum::http::{Method, StatusCode};
use common::spawn_app;
use shortly::config::LoggerMode;
use shortly::persister::{self, Persister};
use shortly::queue::ClickQueue;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_queued_clicks_are_persisted() {
    let app = spawn_app(LoggerMode::Queue).await;
    app.set_options(1, &[("url_limit", "3")]).await;
    let token = app.owner_token(1);
    let code = app.mint(&token, "example.com").await;

    for _ in 0..3 {
        assert_eq!(app.get(&format!("/{code}")).await.status, StatusCode::SEE_OTHER);
    }
    app.drain_clicks().await;

    let queue = ClickQueue::new(app.storage.clone(), &app.config.redirect_logger);
    assert_eq!(queue.depth().await.unwrap(), 3);
    assert_eq!(app.storage.total_clicks(1).await.unwrap(), 0);

    let mut config = app.config.persister.clone();
    config.idle_timeout_ms = 50;
    let persister = Persister::new(queue.clone(), app.storage.clone(), &config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(async move { persister.run(shutdown_rx).await });

    let mut saved = 0;
    for _ in 0..50 {
        saved = app.storage.total_clicks(1).await.unwrap();
        if saved == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown_tx.send(true).unwrap();
    worker.await.unwrap();

    assert_eq!(saved, 3);
    assert_eq!(queue.depth().await.unwrap(), 0);

    let total = app
        .call(Method::GET, "/api/v1/users/links/clicks/total", &token)
        .await;
    assert_eq!(total.json()["result"], 3);
}

#[tokio::test]
async fn test_spawned_persister_stops_on_shutdown() {
    let app = spawn_app(LoggerMode::Queue).await;
    let queue = ClickQueue::new(app.storage.clone(), &app.config.redirect_logger);
    let persister = Persister::new(queue, app.storage.clone(), &app.config.persister);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = persister::spawn(persister, shutdown_rx, Duration::from_secs(5));
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("persister did not stop")
        .unwrap();
}
