use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::Limiter;
use crate::config::{BillingConfig, PaymentConfig};
use crate::models::AccountPlan;
use crate::storage::Storage;

/// Asks the payment side whether an account's subscription is still paid
#[async_trait]
pub trait SubscriptionChecker: Send + Sync {
    async fn is_active(&self, plan: &AccountPlan) -> Result<bool>;
}

/// Used when no payment endpoint is configured: an expired plan has lapsed
pub struct ExpiryChecker;

#[async_trait]
impl SubscriptionChecker for ExpiryChecker {
    async fn is_active(&self, plan: &AccountPlan) -> Result<bool> {
        Ok(!plan.is_expired(chrono::Utc::now().timestamp()))
    }
}

pub struct HttpSubscriptionChecker {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SubscriptionStatus {
    active: bool,
}

impl HttpSubscriptionChecker {
    pub fn new(config: &PaymentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build payment HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SubscriptionChecker for HttpSubscriptionChecker {
    async fn is_active(&self, plan: &AccountPlan) -> Result<bool> {
        let url = format!("{}/accounts/{}/subscription", self.endpoint, plan.account_id);
        let status: SubscriptionStatus = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status.active)
    }
}

pub fn build_checker(config: &BillingConfig) -> Result<Arc<dyn SubscriptionChecker>> {
    Ok(match &config.payment {
        Some(payment) => {
            info!(endpoint = %payment.endpoint, "checking subscriptions against payment endpoint");
            Arc::new(HttpSubscriptionChecker::new(payment)?)
        }
        None => Arc::new(ExpiryChecker),
    })
}

/// Periodic sweep that downgrades accounts whose plan expired and whose
/// subscription is no longer paid.
pub struct Reconciler {
    storage: Arc<dyn Storage>,
    limiter: Limiter,
    checker: Arc<dyn SubscriptionChecker>,
    interval: Duration,
    max_concurrency: usize,
}

impl Reconciler {
    pub fn new(
        storage: Arc<dyn Storage>,
        limiter: Limiter,
        checker: Arc<dyn SubscriptionChecker>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            storage,
            limiter,
            checker,
            interval: Duration::from_millis(config.reconcile_interval_ms),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(error = %err, "subscription reconciliation failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("subscription reconciler stopped");
                        break;
                    }
                }
            }
        })
    }

    /// One pass over the active plans. Waits for every account it started
    /// and returns how many were downgraded.
    pub async fn tick(&self) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let expired: Vec<AccountPlan> = self
            .storage
            .active_account_plans()
            .await?
            .into_iter()
            .filter(|plan| plan.is_expired(now))
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }
        debug!(count = expired.len(), "reconciling expired plans");

        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for plan in expired {
            let permits = Arc::clone(&permits);
            let limiter = self.limiter.clone();
            let checker = Arc::clone(&self.checker);
            tasks.spawn(reconcile_account(permits, limiter, checker, plan));
        }

        let mut downgraded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(true)) => downgraded += 1,
                Ok(Ok(false)) => {}
                Ok(Err(err)) => error!(error = %err, "downgrade failed"),
                Err(err) => error!(error = %err, "reconcile task panicked"),
            }
        }
        self.limiter.prune_locks();
        Ok(downgraded)
    }
}

async fn reconcile_account(
    permits: Arc<Semaphore>,
    limiter: Limiter,
    checker: Arc<dyn SubscriptionChecker>,
    plan: AccountPlan,
) -> Result<bool> {
    let _permit = permits.acquire_owned().await?;
    let _lock = limiter.lock(plan.account_id).await;

    // an unanswered check counts as unpaid
    let active = match checker.is_active(&plan).await {
        Ok(active) => active,
        Err(err) => {
            warn!(account_id = plan.account_id, error = %err, "subscription check failed");
            false
        }
    };
    if active {
        return Ok(false);
    }

    limiter.downgrade_to_default(plan.account_id).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Kv;
    use crate::models::{BillingOption, URL_LIMIT};
    use crate::storage::SqliteStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedChecker {
        active: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionChecker for FixedChecker {
        async fn is_active(&self, _plan: &AccountPlan) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.active)
        }
    }

    struct FailingChecker;

    #[async_trait]
    impl SubscriptionChecker for FailingChecker {
        async fn is_active(&self, _plan: &AccountPlan) -> Result<bool> {
            anyhow::bail!("payment system unreachable")
        }
    }

    fn billing_config() -> BillingConfig {
        BillingConfig {
            default_plan: "free".to_string(),
            reconcile_interval_ms: 50,
            max_concurrency: 2,
            payment: None,
        }
    }

    async fn setup() -> (tempfile::TempDir, Arc<dyn Storage>, Limiter) {
        let dir = tempfile::tempdir().unwrap();
        let kv = Kv::open(dir.path().join("kv.redb")).unwrap();
        let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
        storage.init().await.unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage);
        storage
            .create_plan("free", 0, &[BillingOption::new(URL_LIMIT, 3)])
            .await
            .unwrap();
        let limiter = Limiter::new(kv, Arc::clone(&storage), "free");
        (dir, storage, limiter)
    }

    async fn expired_account(storage: &Arc<dyn Storage>) -> i64 {
        let account = storage.create_account("acme").await.unwrap();
        let pro = storage
            .create_plan("pro", 10, &[BillingOption::new(URL_LIMIT, 100)])
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp();
        storage.apply_plan(account, pro, now - 7200, now - 3600).await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_lapsed_subscription_is_downgraded() {
        let (_dir, storage, limiter) = setup().await;
        let account = expired_account(&storage).await;
        let checker = Arc::new(FixedChecker { active: false, calls: AtomicUsize::new(0) });

        let reconciler =
            Reconciler::new(Arc::clone(&storage), limiter.clone(), checker.clone(), &billing_config());
        assert_eq!(reconciler.tick().await.unwrap(), 1);
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.get_option(URL_LIMIT, account).await.unwrap().value, "3");

        // the default plan is now active and far from expiry
        assert_eq!(reconciler.tick().await.unwrap(), 0);
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_check_downgrades() {
        let (_dir, storage, limiter) = setup().await;
        let account = expired_account(&storage).await;

        let reconciler = Reconciler::new(
            Arc::clone(&storage),
            limiter.clone(),
            Arc::new(FailingChecker),
            &billing_config(),
        );
        assert_eq!(reconciler.tick().await.unwrap(), 1);
        assert_eq!(limiter.get_option(URL_LIMIT, account).await.unwrap().value, "3");

        let plans = storage.active_account_plans().await.unwrap();
        assert_eq!(plans[0].plan_name, "free");
    }

    #[tokio::test]
    async fn test_paid_subscription_is_kept() {
        let (_dir, storage, limiter) = setup().await;
        expired_account(&storage).await;
        let checker = Arc::new(FixedChecker { active: true, calls: AtomicUsize::new(0) });

        let reconciler = Reconciler::new(Arc::clone(&storage), limiter, checker, &billing_config());
        assert_eq!(reconciler.tick().await.unwrap(), 0);

        let plans = storage.active_account_plans().await.unwrap();
        assert_eq!(plans[0].plan_name, "pro");
    }

    #[tokio::test]
    async fn test_expiry_checker() {
        let now = chrono::Utc::now().timestamp();
        let mut plan = AccountPlan {
            account_id: 1,
            plan_id: 1,
            plan_name: "pro".to_string(),
            start_at: now - 10,
            end_at: now + 3600,
            options: Vec::new(),
        };
        assert!(ExpiryChecker.is_active(&plan).await.unwrap());
        plan.end_at = now - 1;
        assert!(!ExpiryChecker.is_active(&plan).await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let (_dir, storage, limiter) = setup().await;
        let account = expired_account(&storage).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Reconciler::new(
            Arc::clone(&storage),
            limiter.clone(),
            Arc::new(ExpiryChecker),
            &billing_config(),
        )
        .spawn(shutdown_rx);

        time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(limiter.get_option(URL_LIMIT, account).await.unwrap().value, "3");
    }
}
