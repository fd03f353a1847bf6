//! Short code -> long url lookup on the redirect path.
//!
//! The relational store stays authoritative. A cache may be cold, stale
//! after a delete, or filled by read-through; callers log cache failures and
//! carry on.

pub mod kv;
pub mod memcached;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CacheConfig, CacheKind};
use crate::kv::Kv;
use crate::storage::Storage;

pub use kv::RedbCache;
pub use memcached::MemcachedCache;
pub use memory::MemoryCache;

/// How often TTL'd entries are swept from the local caches
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{0} cache does not support this operation")]
    Unsupported(&'static str),
    #[error("cache protocol error: {0}")]
    Protocol(String),
    #[error("cache request timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait UrlCache: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` is a miss, not an error
    async fn load(&self, short_code: &str) -> CacheResult<Option<String>>;

    async fn store(&self, short_code: &str, long_url: &str) -> CacheResult<()>;

    async fn store_exp(&self, short_code: &str, long_url: &str, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, short_code: &str) -> CacheResult<()>;

    /// Visit each entry of a snapshot at most once, stopping when `f`
    /// returns false.
    async fn range(
        &self,
        f: &mut (dyn for<'a, 'b> FnMut(&'a str, &'b str) -> bool + Send),
    ) -> CacheResult<()>;

    async fn ping(&self) -> CacheResult<()>;
}

/// Build the cache selected by configuration
pub fn build(config: &CacheConfig, kv: &Kv) -> anyhow::Result<Arc<dyn UrlCache>> {
    let cache: Arc<dyn UrlCache> = match config.kind {
        CacheKind::Memory => Arc::new(MemoryCache::new()),
        CacheKind::Redb => Arc::new(RedbCache::new(kv.clone())),
        CacheKind::Memcached => Arc::new(MemcachedCache::new(
            config.memcached.servers.clone(),
            Duration::from_millis(config.memcached.timeout_ms),
        )?),
    };
    info!(cache = cache.name(), "URL cache ready");
    Ok(cache)
}

/// Stream every stored link into the cache. Per-entry failures are logged
/// and skipped. Returns the number of entries written.
pub async fn warm_up(cache: &dyn UrlCache, storage: &dyn Storage) -> anyhow::Result<usize> {
    let links = storage.all_links().await?;
    let total = links.len();
    let mut stored = 0;

    for (short_code, long_url, _) in links {
        match cache.store(&short_code, &long_url).await {
            Ok(()) => stored += 1,
            Err(err) => warn!(short_code = %short_code, error = %err, "cache warm-up store failed"),
        }
    }

    info!(stored, total, "URL cache warmed up");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    #[tokio::test]
    async fn test_warm_up_streams_all_links() {
        let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
        storage.init().await.unwrap();
        storage.create_link(1, "abc12", "https://ex.com/p", None).await.unwrap();
        storage.create_link(2, "xyz98", "ex.org", None).await.unwrap();

        let cache = MemoryCache::new();
        let stored = warm_up(&cache, &storage).await.unwrap();
        assert_eq!(stored, 2);
        assert_eq!(cache.load("abc12").await.unwrap().as_deref(), Some("https://ex.com/p"));
        assert_eq!(cache.load("xyz98").await.unwrap().as_deref(), Some("ex.org"));
    }
}
