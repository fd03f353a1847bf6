use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time;

use super::{CacheResult, UrlCache, SWEEP_INTERVAL};

#[derive(Debug, Clone)]
struct Entry {
    long_url: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache on a sharded concurrent map
pub struct MemoryCache {
    entries: Arc<DashMap<String, Entry>>,
    shutdown_tx: watch::Sender<bool>,
}

impl MemoryCache {
    /// Must be called inside a tokio runtime; spawns the expiry sweeper
    pub fn new() -> Self {
        let entries: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let sweep = Arc::clone(&entries);
        tokio::spawn(async move {
            let mut interval = time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        sweep.retain(|_, entry| entry.is_live(now));
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self {
            entries,
            shutdown_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl UrlCache for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, short_code: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(short_code)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.long_url.clone()))
    }

    async fn store(&self, short_code: &str, long_url: &str) -> CacheResult<()> {
        self.entries.insert(
            short_code.to_string(),
            Entry {
                long_url: long_url.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn store_exp(&self, short_code: &str, long_url: &str, ttl: Duration) -> CacheResult<()> {
        self.entries.insert(
            short_code.to_string(),
            Entry {
                long_url: long_url.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, short_code: &str) -> CacheResult<()> {
        self.entries.remove(short_code);
        Ok(())
    }

    async fn range(
        &self,
        f: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b str) -> bool + Send),
    ) -> CacheResult<()> {
        let now = Instant::now();
        // Snapshot first so the callback never runs under a shard lock
        let snapshot: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .map(|entry| (entry.key().clone(), entry.long_url.clone()))
            .collect();

        for (short_code, long_url) in &snapshot {
            if !f(short_code, long_url) {
                break;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_load_delete() {
        let cache = MemoryCache::new();
        assert_eq!(cache.load("abc12").await.unwrap(), None);

        cache.store("abc12", "https://ex.com/p").await.unwrap();
        assert_eq!(cache.load("abc12").await.unwrap().as_deref(), Some("https://ex.com/p"));

        cache.delete("abc12").await.unwrap();
        assert_eq!(cache.load("abc12").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_exp_expires() {
        let cache = MemoryCache::new();
        cache
            .store_exp("abc12", "https://ex.com", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(cache.load("abc12").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.load("abc12").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_range_visits_each_entry_once_and_stops() {
        let cache = MemoryCache::new();
        for i in 0..10 {
            cache.store(&format!("code{i}"), "https://ex.com").await.unwrap();
        }

        let mut seen = Vec::new();
        cache
            .range(&mut |short, _| {
                seen.push(short.to_string());
                true
            })
            .await
            .unwrap();
        assert_eq!(seen.len(), 10);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10, "an entry was visited twice");

        let mut visited = 0;
        cache
            .range(&mut |_, _| {
                visited += 1;
                visited < 3
            })
            .await
            .unwrap();
        assert_eq!(visited, 3);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.store(&format!("k{i}"), &format!("https://ex.com/{i}")).await.unwrap();
                cache.load(&format!("k{i}")).await.unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), Some(format!("https://ex.com/{i}")));
        }
        assert_eq!(cache.len(), 20);
    }
}
