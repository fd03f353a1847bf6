use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::PersisterConfig;
use crate::models::ClickEvent;
use crate::queue::{ClickQueue, Delivery};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Saved,
    Rejected,
}

/// Drains the click queue into the `redirect_log` table
pub struct Persister {
    queue: ClickQueue,
    storage: Arc<dyn Storage>,
    batch_size: usize,
    idle_timeout: Duration,
}

impl Persister {
    pub fn new(queue: ClickQueue, storage: Arc<dyn Storage>, config: &PersisterConfig) -> Self {
        Self {
            queue,
            storage,
            batch_size: config.batch_size.max(1),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        let event: ClickEvent = match serde_json::from_str(&delivery.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(id = delivery.id, error = %err, "undecodable click payload");
                return self.reject(delivery).await;
            }
        };

        let logged_at = chrono::Utc::now().timestamp();
        if let Err(err) = self.storage.insert_click(&event, logged_at).await {
            error!(short_code = %event.short_code, error = %err, "failed to save click");
            return self.reject(delivery).await;
        }

        let id = delivery.id;
        if let Err(err) = delivery.ack().await {
            // saved but not acked: the row comes back and is saved twice
            warn!(id, error = %err, "failed to ack click message");
        }
        Outcome::Saved
    }

    async fn reject(&self, delivery: Delivery) -> Outcome {
        let id = delivery.id;
        if let Err(err) = delivery.reject().await {
            error!(id, error = %err, "failed to reject click message");
        }
        Outcome::Rejected
    }

    /// Consume until `shutdown_rx` fires. A batch that was already claimed
    /// is always finished before returning.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(queue = self.queue.name(), batch_size = self.batch_size, "click persister started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let batch = tokio::select! {
                _ = shutdown_rx.changed() => break,
                batch = self.queue.consume(self.batch_size, self.idle_timeout) => batch,
            };

            match batch {
                Ok(deliveries) => {
                    if !deliveries.is_empty() {
                        debug!(count = deliveries.len(), "persisting click batch");
                    }
                    for delivery in deliveries {
                        self.handle(delivery).await;
                    }
                }
                Err(err) => {
                    error!(error = %err, "failed to consume click queue");
                    time::sleep(self.idle_timeout).await;
                }
            }
        }

        info!("click persister stopped");
    }
}

/// Run a persister in the background until `shutdown_rx` fires, then give
/// it `grace` to finish its batch and close the store.
pub fn spawn(
    persister: Persister,
    shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) -> tokio::task::JoinHandle<()> {
    let mut stop_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        let storage = Arc::clone(&persister.storage);
        let work = persister.run(shutdown_rx);
        tokio::pin!(work);

        tokio::select! {
            _ = &mut work => {}
            _ = async {
                let _ = stop_rx.wait_for(|stop| *stop).await;
                time::sleep(grace).await;
            } => warn!("click persister did not drain within the grace period"),
        }
        storage.close().await;
    })
}
