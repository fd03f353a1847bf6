use dashmap::DashMap;
use redb::ReadableTable;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::kv::{Kv, BILLING};
use crate::models::{BillingOption, OptionValueError, PASSTHROUGH_OPTIONS, URL_LIMIT};
use crate::storage::Storage;

/// How long a downgraded account keeps the default plan
const DEFAULT_PLAN_YEARS: i64 = 100;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("plan limit exceeded")]
    LimitExceeded,
    #[error("billing option {0} not found")]
    OptionNotFound(String),
    #[error("unsupported billing option {0}")]
    UnsupportedOption(String),
    #[error("default plan {0} does not exist")]
    DefaultPlanMissing(String),
    #[error(transparent)]
    Value(#[from] OptionValueError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type LimiterResult<T> = Result<T, LimiterError>;

/// Per-account quota values, one JSON blob per account in the `billing`
/// table. Every mutation rewrites the whole blob inside one redb write
/// transaction.
#[derive(Clone)]
pub struct Limiter {
    kv: Kv,
    storage: Arc<dyn Storage>,
    default_plan: String,
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

fn read_blob(
    table: &impl ReadableTable<i64, &'static str>,
    account_id: i64,
) -> anyhow::Result<Option<Vec<BillingOption>>> {
    match table.get(account_id)? {
        Some(blob) => Ok(Some(serde_json::from_str(blob.value())?)),
        None => Ok(None),
    }
}

/// Turn a plan's declared options into the account's starting values.
/// `url_limit` becomes what is left after the links the account already has.
pub fn plan_to_account_options(
    options: &[BillingOption],
    link_count: i64,
) -> LimiterResult<Vec<BillingOption>> {
    options
        .iter()
        .map(|option| {
            if option.name == URL_LIMIT {
                let max = option.int_value()?;
                Ok(BillingOption::new(URL_LIMIT, max - link_count))
            } else if PASSTHROUGH_OPTIONS.contains(&option.name.as_str()) {
                Ok(option.clone())
            } else {
                Err(LimiterError::UnsupportedOption(option.name.clone()))
            }
        })
        .collect()
}

impl Limiter {
    pub fn new(kv: Kv, storage: Arc<dyn Storage>, default_plan: impl Into<String>) -> Self {
        Self {
            kv,
            storage,
            default_plan: default_plan.into(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Replace the account's whole option set
    pub async fn set_plan_options(
        &self,
        account_id: i64,
        options: Vec<BillingOption>,
    ) -> LimiterResult<()> {
        let blob = serde_json::to_string(&options).map_err(anyhow::Error::from)?;
        self.kv
            .write(move |txn| {
                txn.open_table(BILLING)?.insert(account_id, blob.as_str())?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Seed every account with an active plan. Returns the number of
    /// accounts written.
    pub async fn load_all(&self) -> LimiterResult<usize> {
        let plans = self.storage.active_account_plans().await?;
        let total = plans.len();

        for plan in plans {
            let link_count = self.storage.count_links(plan.account_id).await?;
            let options = plan_to_account_options(&plan.options, link_count)?;
            self.set_plan_options(plan.account_id, options).await?;
        }

        info!(accounts = total, "billing limiter loaded");
        Ok(total)
    }

    pub async fn get_option(&self, name: &str, account_id: i64) -> LimiterResult<BillingOption> {
        let wanted = name.to_string();
        let found = self
            .kv
            .read(move |txn| {
                let table = txn.open_table(BILLING)?;
                let options = read_blob(&table, account_id)?.unwrap_or_default();
                Ok(options.into_iter().find(|option| option.name == wanted))
            })
            .await?;

        found.ok_or_else(|| LimiterError::OptionNotFound(name.to_string()))
    }

    /// Admission: succeed only when the option exists and is positive
    pub async fn check(&self, name: &str, account_id: i64) -> LimiterResult<()> {
        let option = match self.get_option(name, account_id).await {
            Ok(option) => option,
            Err(LimiterError::OptionNotFound(_)) => return Err(LimiterError::LimitExceeded),
            Err(err) => return Err(err),
        };

        if option.int_value()? <= 0 {
            return Err(LimiterError::LimitExceeded);
        }
        Ok(())
    }

    /// Decrement the option by one. A value already at or below zero is
    /// left untouched.
    pub async fn reduce(&self, name: &str, account_id: i64) -> LimiterResult<()> {
        let _guard = self.lock(account_id).await;
        let wanted = name.to_string();

        self.kv
            .write(move |txn| {
                let mut table = txn.open_table(BILLING)?;
                let Some(mut options) = read_blob(&table, account_id)? else {
                    return Ok(Err(LimiterError::LimitExceeded));
                };
                let Some(option) = options.iter_mut().find(|option| option.name == wanted) else {
                    return Ok(Err(LimiterError::LimitExceeded));
                };

                let value = match option.int_value() {
                    Ok(value) => value,
                    Err(err) => return Ok(Err(err.into())),
                };
                if value <= 0 {
                    return Ok(Ok(()));
                }
                option.value = (value - 1).to_string();

                let blob = serde_json::to_string(&options)?;
                table.insert(account_id, blob.as_str())?;
                Ok(Ok(()))
            })
            .await?
    }

    /// Exclusive per-account lock, held while an account's plan is being
    /// reconciled. Entries live until `prune_locks` finds them idle.
    pub async fn lock(&self, account_id: i64) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(account_id).or_default().value());
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on. A held guard keeps its
    /// own reference, so a busy entry is never removed.
    pub fn prune_locks(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    /// Move the account to the default plan and reset its options from it.
    /// The caller should hold `lock(account_id)`.
    pub async fn downgrade_to_default(&self, account_id: i64) -> LimiterResult<()> {
        let plan = self
            .storage
            .find_plan(&self.default_plan)
            .await?
            .ok_or_else(|| LimiterError::DefaultPlanMissing(self.default_plan.clone()))?;

        let now = chrono::Utc::now();
        let end = now + chrono::Duration::days(365 * DEFAULT_PLAN_YEARS);
        self.storage
            .apply_plan(account_id, plan.id, now.timestamp(), end.timestamp())
            .await?;

        let link_count = self.storage.count_links(account_id).await?;
        let options = plan_to_account_options(&plan.options, link_count)?;
        self.set_plan_options(account_id, options).await?;

        warn!(account_id, plan = %plan.name, "account downgraded to default plan");
        Ok(())
    }
}
