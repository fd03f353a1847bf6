//! Link lifecycle: minting under quota, removal, and short code resolution
//! for the redirect path.

use moka::future::Cache;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::billing::{Limiter, LimiterError};
use crate::cache::UrlCache;
use crate::minter::{generate_code, MAX_ATTEMPTS};
use crate::models::{Link, URL_LIMIT};
use crate::storage::{Storage, StorageError};
use crate::timeseries::TimeSeries;

#[derive(Debug, Error)]
pub enum MintError {
    #[error("url is required")]
    EmptyUrl,
    #[error("url has incorrect format")]
    InvalidUrl,
    #[error("plan limit exceeded")]
    LimitExceeded,
    #[error("could not find a free short code")]
    CodeExhaustion,
    #[error(transparent)]
    Limiter(LimiterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<LimiterError> for MintError {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::LimitExceeded => MintError::LimitExceeded,
            other => MintError::Limiter(other),
        }
    }
}

/// Prefix `https://` unless the url already names http or https
pub fn with_scheme(long_url: &str) -> Cow<'_, str> {
    let lower = long_url.get(..8).unwrap_or(long_url).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Cow::Borrowed(long_url)
    } else {
        Cow::Owned(format!("https://{long_url}"))
    }
}

/// Where new short codes come from
pub type CodeSource = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct LinkService {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn UrlCache>,
    limiter: Limiter,
    timeseries: TimeSeries,
    /// Short codes recently confirmed absent from storage
    misses: Cache<String, ()>,
    codes: CodeSource,
}

impl LinkService {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<dyn UrlCache>,
        limiter: Limiter,
        timeseries: TimeSeries,
        miss_ttl: Duration,
        miss_capacity: u64,
    ) -> Self {
        Self {
            storage,
            cache,
            limiter,
            timeseries,
            misses: Cache::builder()
                .max_capacity(miss_capacity)
                .time_to_live(miss_ttl)
                .build(),
            codes: Arc::new(generate_code),
        }
    }

    /// Replace the random code generator
    pub fn with_code_source(mut self, codes: CodeSource) -> Self {
        self.codes = codes;
        self
    }

    /// Create a link for `account_id`.
    ///
    /// Admission is checked on `url_limit` first. A short code collision
    /// is retried with a fresh code. Once the row exists the link is
    /// mirrored into the cache, registered with the time-series store and
    /// the quota is decremented; failures of those steps are logged.
    pub async fn mint(
        &self,
        account_id: i64,
        long_url: &str,
        description: Option<&str>,
    ) -> Result<Link, MintError> {
        let long_url = long_url.trim();
        if long_url.is_empty() {
            return Err(MintError::EmptyUrl);
        }
        if url::Url::parse(&with_scheme(long_url)).is_err() {
            return Err(MintError::InvalidUrl);
        }

        self.limiter.check(URL_LIMIT, account_id).await?;

        let mut created = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let code = (self.codes)();
            match self
                .storage
                .create_link(account_id, &code, long_url, description)
                .await
            {
                Ok(link) => {
                    created = Some(link);
                    break;
                }
                Err(StorageError::Conflict) => {
                    debug!(short_code = %code, attempt, "short code collision");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let link = created.ok_or(MintError::CodeExhaustion)?;

        if let Err(err) = self.cache.store(&link.short_code, &link.long_url).await {
            warn!(short_code = %link.short_code, error = %err, "failed to cache new link");
        }
        self.misses.invalidate(&link.short_code).await;

        if let Err(err) = self.timeseries.register_link(&link.short_code, account_id).await {
            error!(short_code = %link.short_code, error = %err, "failed to register link for stats");
        }

        if let Err(err) = self.limiter.reduce(URL_LIMIT, account_id).await {
            warn!(account_id, error = %err, "failed to decrement url_limit");
        }

        Ok(link)
    }

    /// Delete one of the account's links and drop it from the cache
    pub async fn remove(&self, account_id: i64, short_code: &str) -> Result<i64, StorageError> {
        let link_id = self.storage.delete_link(account_id, short_code).await?;
        if let Err(err) = self.cache.delete(short_code).await {
            warn!(short_code, error = %err, "failed to evict removed link");
        }
        Ok(link_id)
    }

    /// Cache first, then storage. A storage hit is written back to the
    /// cache; a storage miss is remembered for a short while.
    pub async fn resolve(&self, short_code: &str) -> anyhow::Result<Option<String>> {
        match self.cache.load(short_code).await {
            Ok(Some(long_url)) => return Ok(Some(long_url)),
            Ok(None) => {}
            Err(err) => warn!(short_code, error = %err, "cache lookup failed"),
        }

        if self.misses.contains_key(short_code) {
            return Ok(None);
        }

        match self.storage.find_link(short_code).await? {
            Some(link) => {
                if let Err(err) = self.cache.store(short_code, &link.long_url).await {
                    warn!(short_code, error = %err, "failed to cache resolved link");
                }
                Ok(Some(link.long_url))
            }
            None => {
                self.misses.insert(short_code.to_string(), ()).await;
                Ok(None)
            }
        }
    }
}
