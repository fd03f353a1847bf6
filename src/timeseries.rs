//! Per-link day buckets backing the chart endpoints.
//!
//! Buckets live in the `buckets` table keyed by `(bucket_name, day_key)`,
//! where `day_key` is the RFC3339 form of UTC midnight. That form sorts
//! chronologically, so a day range is a plain key range scan.

use chrono::{DateTime, SecondsFormat, Utc};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::{Limiter, LimiterError};
use crate::kv::{Kv, BUCKETS, DETAILS};
use crate::models::TIMEDATA_LIMIT;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum TimeSeriesError {
    #[error("link not found")]
    NotFound,
    #[error("plan limit exceeded")]
    LimitExceeded,
    #[error("invalid timestamp {0}")]
    InvalidTime(i64),
    #[error(transparent)]
    Limiter(#[from] LimiterError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub time: String,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinkDetails {
    account_id: i64,
}

pub fn clicks_bucket(short_code: &str) -> String {
    format!("clicks:{short_code}")
}

pub fn unique_bucket(ip: &str, short_code: &str) -> String {
    format!("unique:{ip}:{short_code}")
}

fn to_datetime(ts: i64) -> Result<DateTime<Utc>, TimeSeriesError> {
    DateTime::from_timestamp(ts, 0).ok_or(TimeSeriesError::InvalidTime(ts))
}

pub fn rfc3339(ts: i64) -> Result<String, TimeSeriesError> {
    Ok(to_datetime(ts)?.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// RFC3339 of UTC midnight of the day containing `ts`
pub fn day_key(ts: i64) -> Result<String, TimeSeriesError> {
    rfc3339(ts - ts.rem_euclid(SECONDS_PER_DAY))
}

fn bump(
    table: &mut redb::Table<'_, (&'static str, &'static str), u64>,
    bucket: &str,
    day: &str,
) -> anyhow::Result<u64> {
    let current = table.get((bucket, day))?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert((bucket, day), next)?;
    Ok(next)
}

#[derive(Clone)]
pub struct TimeSeries {
    kv: Kv,
    limiter: Limiter,
}

impl TimeSeries {
    pub fn new(kv: Kv, limiter: Limiter) -> Self {
        Self { kv, limiter }
    }

    /// Record which account owns `short_code`
    pub async fn register_link(&self, short_code: &str, account_id: i64) -> anyhow::Result<()> {
        let key = short_code.to_string();
        let details = serde_json::to_string(&LinkDetails { account_id })?;
        self.kv
            .write(move |txn| {
                txn.open_table(DETAILS)?
                    .insert(key.as_str(), details.as_str())?;
                Ok(())
            })
            .await
    }

    /// Add one to a bucket for the day of `observed_at`. Returns the new
    /// count.
    pub async fn increment(&self, bucket: &str, observed_at: i64) -> Result<u64, TimeSeriesError> {
        let day = day_key(observed_at)?;
        let bucket = bucket.to_string();
        let count = self
            .kv
            .write(move |txn| {
                let mut table = txn.open_table(BUCKETS)?;
                bump(&mut table, &bucket, &day)
            })
            .await?;
        Ok(count)
    }

    /// Count one click on a registered link, plus its per-IP unique bucket
    /// when the client address is known. Returns false, writing nothing,
    /// when the link was never registered.
    pub async fn record_click(
        &self,
        short_code: &str,
        ip: Option<&str>,
        observed_at: i64,
    ) -> Result<bool, TimeSeriesError> {
        let day = day_key(observed_at)?;
        let clicks = clicks_bucket(short_code);
        let unique = ip.map(|ip| unique_bucket(ip, short_code));
        let key = short_code.to_string();

        let recorded = self
            .kv
            .write(move |txn| {
                if txn.open_table(DETAILS)?.get(key.as_str())?.is_none() {
                    return Ok(false);
                }
                let mut table = txn.open_table(BUCKETS)?;
                bump(&mut table, &clicks, &day)?;
                if let Some(unique) = &unique {
                    bump(&mut table, unique, &day)?;
                }
                Ok(true)
            })
            .await?;
        Ok(recorded)
    }

    async fn owner(&self, short_code: &str) -> anyhow::Result<Option<i64>> {
        let key = short_code.to_string();
        self.kv
            .read(move |txn| {
                let table = txn.open_table(DETAILS)?;
                let owner = match table.get(key.as_str())? {
                    Some(raw) => Some(serde_json::from_str::<LinkDetails>(raw.value())?.account_id),
                    None => None,
                };
                Ok(owner)
            })
            .await
    }

    /// Daily click counts of `short_code` between `start` and `end`
    /// (inclusive, unix seconds). The span may not exceed the account's
    /// `timedata_limit` unless `limit` overrides it.
    pub async fn query(
        &self,
        account_id: i64,
        short_code: &str,
        start: i64,
        end: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Point>, TimeSeriesError> {
        if self.owner(short_code).await? != Some(account_id) {
            return Err(TimeSeriesError::NotFound);
        }

        let allowed = self
            .limiter
            .get_option(TIMEDATA_LIMIT, account_id)
            .await?
            .int_value()
            .map_err(LimiterError::from)?;
        let allowed = limit.filter(|limit| *limit > 0).unwrap_or(allowed);

        let days = (end - start) / SECONDS_PER_DAY;
        if allowed < days {
            return Err(TimeSeriesError::LimitExceeded);
        }

        let bucket = clicks_bucket(short_code);
        let (from, to) = (rfc3339(start)?, rfc3339(end)?);
        let points = self
            .kv
            .read(move |txn| {
                let table = txn.open_table(BUCKETS)?;
                let mut points = Vec::new();
                for entry in table.range((bucket.as_str(), from.as_str())..=(bucket.as_str(), to.as_str()))? {
                    let (key, count) = entry?;
                    points.push(Point {
                        time: key.value().1.to_string(),
                        count: count.value(),
                    });
                }
                Ok(points)
            })
            .await?;
        Ok(points)
    }
}
