use async_trait::async_trait;
use redb::ReadableTable;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::warn;

use super::{CacheResult, UrlCache, SWEEP_INTERVAL};
use crate::kv::{Kv, URLS, URLS_TTL};

/// Cache persisted in the embedded KV file, so it survives restarts
pub struct RedbCache {
    kv: Kv,
    shutdown_tx: watch::Sender<bool>,
}

impl RedbCache {
    /// Must be called inside a tokio runtime; spawns the expiry sweeper
    pub fn new(kv: Kv) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let sweep_kv = kv.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = sweep_expired(&sweep_kv).await {
                            warn!(error = %err, "failed to sweep expired cache entries");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self { kv, shutdown_tx }
    }
}

impl Drop for RedbCache {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn sweep_expired(kv: &Kv) -> anyhow::Result<usize> {
    kv.write(|txn| {
        let mut ttl = txn.open_table(URLS_TTL)?;
        let now = now();
        let mut expired = Vec::new();
        for entry in ttl.iter()? {
            let (key, expires_at) = entry?;
            if expires_at.value() <= now {
                expired.push(key.value().to_string());
            }
        }

        let mut urls = txn.open_table(URLS)?;
        for key in &expired {
            ttl.remove(key.as_str())?;
            urls.remove(key.as_str())?;
        }
        Ok(expired.len())
    })
    .await
}

#[async_trait]
impl UrlCache for RedbCache {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn load(&self, short_code: &str) -> CacheResult<Option<String>> {
        let key = short_code.to_string();
        let value = self
            .kv
            .read(move |txn| {
                let ttl = txn.open_table(URLS_TTL)?;
                if let Some(expires_at) = ttl.get(key.as_str())? {
                    if expires_at.value() <= now() {
                        return Ok(None);
                    }
                }
                let urls = txn.open_table(URLS)?;
                let value = urls.get(key.as_str())?.map(|v| v.value().to_string());
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    async fn store(&self, short_code: &str, long_url: &str) -> CacheResult<()> {
        let (key, value) = (short_code.to_string(), long_url.to_string());
        self.kv
            .write(move |txn| {
                txn.open_table(URLS)?.insert(key.as_str(), value.as_str())?;
                txn.open_table(URLS_TTL)?.remove(key.as_str())?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn store_exp(&self, short_code: &str, long_url: &str, ttl: Duration) -> CacheResult<()> {
        let (key, value) = (short_code.to_string(), long_url.to_string());
        let expires_at = now() + ttl.as_secs().max(1) as i64;
        self.kv
            .write(move |txn| {
                txn.open_table(URLS)?.insert(key.as_str(), value.as_str())?;
                txn.open_table(URLS_TTL)?.insert(key.as_str(), expires_at)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, short_code: &str) -> CacheResult<()> {
        let key = short_code.to_string();
        self.kv
            .write(move |txn| {
                txn.open_table(URLS)?.remove(key.as_str())?;
                txn.open_table(URLS_TTL)?.remove(key.as_str())?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn range(
        &self,
        f: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b str) -> bool + Send),
    ) -> CacheResult<()> {
        let snapshot = self
            .kv
            .read(|txn| {
                let urls = txn.open_table(URLS)?;
                let ttl = txn.open_table(URLS_TTL)?;
                let now = now();
                let mut entries = Vec::new();
                for entry in urls.iter()? {
                    let (key, value) = entry?;
                    let expired = ttl
                        .get(key.value())?
                        .is_some_and(|expires_at| expires_at.value() <= now);
                    if !expired {
                        entries.push((key.value().to_string(), value.value().to_string()));
                    }
                }
                Ok(entries)
            })
            .await?;

        for (short_code, long_url) in &snapshot {
            if !f(short_code, long_url) {
                break;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.kv
            .read(|txn| {
                txn.open_table(URLS)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_cache() -> (tempfile::TempDir, RedbCache) {
        let dir = tempfile::tempdir().unwrap();
        let kv = Kv::open(dir.path().join("cache.redb")).unwrap();
        (dir, RedbCache::new(kv))
    }

    #[tokio::test]
    async fn test_store_load_delete() {
        let (_dir, cache) = open_cache();
        cache.store("abc12", "https://ex.com/p").await.unwrap();
        assert_eq!(cache.load("abc12").await.unwrap().as_deref(), Some("https://ex.com/p"));

        cache.delete("abc12").await.unwrap();
        assert_eq!(cache.load("abc12").await.unwrap(), None);
        cache.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_clears_previous_ttl() {
        let (_dir, cache) = open_cache();
        cache
            .store_exp("abc12", "https://old.example", Duration::from_secs(1))
            .await
            .unwrap();
        cache.store("abc12", "https://new.example").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(cache.load("abc12").await.unwrap().as_deref(), Some("https://new.example"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_hidden_and_swept() {
        let (_dir, cache) = open_cache();
        cache
            .store_exp("gone1", "https://ex.com", Duration::from_secs(1))
            .await
            .unwrap();
        cache.store("kept1", "https://ex.org").await.unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(cache.load("gone1").await.unwrap(), None);

        let mut seen = Vec::new();
        cache
            .range(&mut |short, long| {
                seen.push((short.to_string(), long.to_string()));
                true
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![("kept1".to_string(), "https://ex.org".to_string())]);
    }
}
