use crate::models::{
    AccountPlan, BillingOption, BillingPlan, Campaign, CampaignLink, ClickEvent, Link, LinkFilter,
    Utm,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("short code already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Other(err.into())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Per-(country, referer) click count for one link
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ClickBreakdown {
    pub country: Option<String>,
    pub referer: String,
    pub count: i64,
}

/// A queue row handed to a consumer
#[derive(Debug, Clone, FromRow)]
pub struct QueuedMessage {
    pub id: i64,
    pub payload: String,
    pub attempts: i64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Create tables and indexes
    async fn init(&self) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Close the pool, waiting for checked-out connections
    async fn close(&self);

    // ---- links ----

    /// Insert a link. Fails with `Conflict` when the short code is taken.
    async fn create_link(
        &self,
        account_id: i64,
        short_code: &str,
        long_url: &str,
        description: Option<&str>,
    ) -> StorageResult<Link>;

    /// Delete an account's link together with its tags and campaign
    /// attachments. Click history is kept. Returns the link id.
    async fn delete_link(&self, account_id: i64, short_code: &str) -> StorageResult<i64>;

    async fn find_link(&self, short_code: &str) -> Result<Option<Link>>;

    async fn list_links(&self, account_id: i64, filter: &LinkFilter) -> Result<Vec<Link>>;

    async fn count_links(&self, account_id: i64) -> Result<i64>;

    /// Every (short_code, long_url, account_id), for cache warm-up
    async fn all_links(&self) -> Result<Vec<(String, String, i64)>>;

    async fn hide_link(&self, account_id: i64, short_code: &str) -> StorageResult<()>;

    async fn add_tag(&self, account_id: i64, short_code: &str, tag: &str) -> StorageResult<()>;

    async fn link_tags(&self, link_id: i64) -> Result<Vec<String>>;

    // ---- click log ----

    /// Append to the click log with `logged_at` as the row timestamp
    async fn insert_click(&self, event: &ClickEvent, logged_at: i64) -> Result<()>;

    async fn total_clicks(&self, account_id: i64) -> Result<i64>;

    /// Timestamps of an account's clicks in `[start, end)`
    async fn click_times(&self, account_id: i64, start: i64, end: i64) -> Result<Vec<i64>>;

    async fn link_breakdown(
        &self,
        short_code: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<ClickBreakdown>>;

    // ---- durable queue ----

    async fn enqueue(&self, queue: &str, payload: &str) -> Result<i64>;

    /// Move up to `limit` ready rows (and unacked rows older than
    /// `visibility_timeout` seconds) to unacked, oldest first.
    async fn claim(
        &self,
        queue: &str,
        consumer: &str,
        limit: i64,
        visibility_timeout: i64,
    ) -> Result<Vec<QueuedMessage>>;

    async fn ack(&self, id: i64) -> Result<()>;

    /// Return the row to ready, or park it once `max_attempts` is reached.
    /// Returns true when the row was parked.
    async fn reject(&self, id: i64, max_attempts: i64) -> Result<bool>;

    async fn queue_depth(&self, queue: &str) -> Result<i64>;

    // ---- accounts and billing ----

    async fn create_account(&self, name: &str) -> Result<i64>;

    async fn create_plan(&self, name: &str, price: i64, options: &[BillingOption]) -> Result<i64>;

    async fn find_plan(&self, name: &str) -> Result<Option<BillingPlan>>;

    /// Make `plan_id` the account's only active plan for `[start, end]`
    async fn apply_plan(&self, account_id: i64, plan_id: i64, start: i64, end: i64) -> Result<()>;

    async fn active_account_plans(&self) -> Result<Vec<AccountPlan>>;

    // ---- campaigns ----

    async fn create_campaign(
        &self,
        account_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<Campaign>;

    async fn attach_to_campaign(
        &self,
        account_id: i64,
        campaign_id: i64,
        short_code: &str,
        utm: &Utm,
    ) -> StorageResult<()>;

    async fn campaign_links(&self, account_id: i64, campaign_id: i64) -> Result<Vec<CampaignLink>>;

    // ---- rbac ----

    async fn grant_permission(&self, role_id: i64, permission: &str) -> Result<()>;

    async fn role_has_permission(&self, role_id: i64, permission: &str) -> Result<bool>;
}
