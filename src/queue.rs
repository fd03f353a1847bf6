//! Durable click log queue on top of the relational store.
//!
//! Rows move `ready -> unacked` when claimed and are deleted on ack. A
//! reject puts the row back to `ready` until it has failed `max_attempts`
//! times, after which it is parked as `rejected`. Unacked rows whose
//! visibility timeout ran out are handed out again, so delivery is
//! at-least-once.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::warn;

use crate::config::RedirectLoggerConfig;
use crate::models::ClickEvent;
use crate::storage::Storage;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode click event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Clone)]
pub struct ClickQueue {
    storage: Arc<dyn Storage>,
    name: String,
    consumer: String,
    max_attempts: i64,
    visibility_timeout: i64,
}

/// One claimed message. Dropping it without ack or reject leaves it to be
/// redelivered after the visibility timeout.
pub struct Delivery {
    pub id: i64,
    pub payload: String,
    pub attempts: i64,
    storage: Arc<dyn Storage>,
    max_attempts: i64,
}

impl Delivery {
    pub async fn ack(self) -> QueueResult<()> {
        self.storage.ack(self.id).await?;
        Ok(())
    }

    /// Returns true when the message was parked for good
    pub async fn reject(self) -> QueueResult<bool> {
        let parked = self.storage.reject(self.id, self.max_attempts).await?;
        if parked {
            warn!(id = self.id, attempts = self.attempts + 1, "click message parked after repeated failures");
        }
        Ok(parked)
    }
}

impl ClickQueue {
    pub fn new(storage: Arc<dyn Storage>, config: &RedirectLoggerConfig) -> Self {
        Self {
            storage,
            name: config.queue.clone(),
            consumer: format!("consumer-{}", std::process::id()),
            max_attempts: config.max_attempts.max(1),
            visibility_timeout: config.visibility_timeout_secs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn publish(&self, event: &ClickEvent) -> QueueResult<i64> {
        let payload = serde_json::to_string(event)?;
        Ok(self.storage.enqueue(&self.name, &payload).await?)
    }

    /// Wait up to `idle_timeout` for messages and return at most
    /// `batch_size` of them, oldest first. An empty batch means the queue
    /// stayed idle.
    pub async fn consume(
        &self,
        batch_size: usize,
        idle_timeout: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let deadline = Instant::now() + idle_timeout;
        loop {
            let rows = self
                .storage
                .claim(
                    &self.name,
                    &self.consumer,
                    batch_size.max(1) as i64,
                    self.visibility_timeout,
                )
                .await?;

            if !rows.is_empty() {
                return Ok(rows
                    .into_iter()
                    .map(|row| Delivery {
                        id: row.id,
                        payload: row.payload,
                        attempts: row.attempts,
                        storage: Arc::clone(&self.storage),
                        max_attempts: self.max_attempts,
                    })
                    .collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Messages waiting or in flight
    pub async fn depth(&self) -> QueueResult<i64> {
        Ok(self.storage.queue_depth(&self.name).await?)
    }
}

/// Where the redirect path sends finished click events
#[async_trait]
pub trait ClickPublisher: Send + Sync {
    async fn publish(&self, event: &ClickEvent) -> anyhow::Result<()>;
}

/// Through the durable queue, for a separate persister to drain
pub struct QueuePublisher {
    queue: ClickQueue,
}

impl QueuePublisher {
    pub fn new(queue: ClickQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ClickPublisher for QueuePublisher {
    async fn publish(&self, event: &ClickEvent) -> anyhow::Result<()> {
        self.queue.publish(event).await?;
        Ok(())
    }
}

/// Straight into the click log
pub struct SyncPublisher {
    storage: Arc<dyn Storage>,
}

impl SyncPublisher {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ClickPublisher for SyncPublisher {
    async fn publish(&self, event: &ClickEvent) -> anyhow::Result<()> {
        self.storage
            .insert_click(event, chrono::Utc::now().timestamp())
            .await
    }
}
