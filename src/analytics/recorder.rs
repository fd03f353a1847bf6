//! Off-request click registration.
//!
//! The redirect handler hands each click to an actor over a bounded channel
//! and returns right away. The actor resolves the country, bumps the
//! time-series buckets and publishes the event to the click log. A full
//! channel drops the click with a warning.

use axum::http::HeaderMap;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analytics::GeoIpService;
use crate::models::ClickEvent;
use crate::queue::ClickPublisher;
use crate::timeseries::TimeSeries;

/// A redirect as seen by the handler
#[derive(Debug, Clone)]
pub struct Click {
    pub short_code: String,
    pub long_url: String,
    pub ip: Option<Ipv4Addr>,
    pub referer: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub observed_at: i64,
}

/// Group header values by lowercase name. Values that are not valid
/// visible ASCII are skipped.
pub fn headers_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

enum RecorderMessage {
    Click(Click),
    Shutdown,
}

struct RecorderActor {
    receiver: mpsc::Receiver<RecorderMessage>,
    timeseries: TimeSeries,
    publisher: Arc<dyn ClickPublisher>,
    geoip: Option<GeoIpService>,
}

impl RecorderActor {
    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                RecorderMessage::Click(click) => self.process(click).await,
                RecorderMessage::Shutdown => {
                    info!("click recorder drained");
                    break;
                }
            }
        }
    }

    async fn process(&self, click: Click) {
        let ip = click.ip.map(|ip| ip.to_string());
        let country = match (&self.geoip, click.ip) {
            (Some(geoip), Some(ip)) => geoip.country(IpAddr::V4(ip)),
            _ => None,
        };

        match self
            .timeseries
            .record_click(&click.short_code, ip.as_deref(), click.observed_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(short_code = %click.short_code, "click on unregistered link"),
            Err(err) => warn!(short_code = %click.short_code, error = %err, "failed to bump click buckets"),
        }

        let event = ClickEvent {
            short_code: click.short_code,
            long_url: click.long_url,
            ip,
            country,
            referer: click.referer,
            headers: click.headers,
            observed_at: click.observed_at,
        };
        if let Err(err) = self.publisher.publish(&event).await {
            error!(short_code = %event.short_code, error = %err, "click event lost");
        }
    }
}

pub struct ClickRecorder {
    sender: mpsc::Sender<RecorderMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClickRecorder {
    pub fn spawn(
        timeseries: TimeSeries,
        publisher: Arc<dyn ClickPublisher>,
        geoip: Option<GeoIpService>,
        buffer_size: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let actor = RecorderActor {
            receiver,
            timeseries,
            publisher,
            geoip,
        };
        let handle = tokio::spawn(actor.run());

        Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Never waits; drops the click when the buffer is full
    pub fn record(&self, click: Click) {
        if let Err(err) = self.sender.try_send(RecorderMessage::Click(click)) {
            warn!(error = %err, "click buffer full, dropping click");
        }
    }

    /// Process everything already queued, then stop the actor
    pub async fn shutdown(&self) {
        let Some(handle) = self.handle.lock().await.take() else {
            return;
        };
        if self.sender.send(RecorderMessage::Shutdown).await.is_err() {
            warn!("click recorder already stopped");
        }
        if let Err(err) = handle.await {
            error!(error = %err, "click recorder task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::Limiter;
    use crate::kv::Kv;
    use crate::models::{BillingOption, TIMEDATA_LIMIT};
    use crate::queue::SyncPublisher;
    use crate::storage::{SqliteStorage, Storage};
    use axum::http::HeaderValue;

    #[test]
    fn test_headers_map_groups_values() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("*/*"));
        headers.insert("user-agent", HeaderValue::from_static("curl/8"));

        let map = headers_map(&headers);
        assert_eq!(map["accept"], vec!["text/html", "*/*"]);
        assert_eq!(map["user-agent"], vec!["curl/8"]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_clicks() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Kv::open(dir.path().join("kv.redb")).unwrap();
        let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
        storage.init().await.unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage);
        storage.create_link(1, "abc12", "https://ex.com", None).await.unwrap();

        let limiter = Limiter::new(kv.clone(), Arc::clone(&storage), "free");
        limiter
            .set_plan_options(1, vec![BillingOption::new(TIMEDATA_LIMIT, 31)])
            .await
            .unwrap();
        let timeseries = TimeSeries::new(kv, limiter);
        timeseries.register_link("abc12", 1).await.unwrap();

        let recorder = ClickRecorder::spawn(
            timeseries.clone(),
            Arc::new(SyncPublisher::new(Arc::clone(&storage))),
            None,
            64,
        );
        let observed_at = 1_704_110_400; // 2024-01-01T12:00:00Z
        for _ in 0..10 {
            recorder.record(Click {
                short_code: "abc12".to_string(),
                long_url: "https://ex.com".to_string(),
                ip: Some(Ipv4Addr::new(8, 8, 8, 8)),
                referer: String::new(),
                headers: BTreeMap::new(),
                observed_at,
            });
        }
        recorder.shutdown().await;
        recorder.shutdown().await;

        assert_eq!(storage.total_clicks(1).await.unwrap(), 10);
        let points = timeseries
            .query(1, "abc12", 1_704_067_200, 1_704_067_200, None)
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].count, 10);
    }
}
