//! Per-account quotas and the background plan reconciliation.

mod limiter;
mod reconciler;

pub use limiter::{plan_to_account_options, Limiter, LimiterError, LimiterResult};
pub use reconciler::{
    build_checker, ExpiryChecker, HttpSubscriptionChecker, Reconciler, SubscriptionChecker,
};
