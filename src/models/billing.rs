use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const URL_LIMIT: &str = "url_limit";
pub const TIMEDATA_LIMIT: &str = "timedata_limit";

/// Option names that are copied from a plan without adjustment
pub const PASSTHROUGH_OPTIONS: &[&str] = &[
    TIMEDATA_LIMIT,
    "users_limit",
    "tags_limit",
    "groups_limit",
    "rate_limit",
];

#[derive(Debug, Error)]
#[error("billing option {name} has non-numeric value {value:?}")]
pub struct OptionValueError {
    pub name: String,
    pub value: String,
}

/// A named quota. The value is kept as the decimal string the plan declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingOption {
    pub name: String,
    pub value: String,
}

impl BillingOption {
    pub fn new(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
        }
    }

    pub fn int_value(&self) -> Result<i64, OptionValueError> {
        self.value.trim().parse().map_err(|_| OptionValueError {
            name: self.name.clone(),
            value: self.value.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPlan {
    pub id: i64,
    pub name: String,
    pub price: i64,
    pub options: Vec<BillingOption>,
}

/// The plan an account currently has active, with the plan's options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPlan {
    pub account_id: i64,
    pub plan_id: i64,
    pub plan_name: String,
    pub start_at: i64,
    pub end_at: i64,
    pub options: Vec<BillingOption>,
}

impl AccountPlan {
    pub fn is_expired(&self, now: i64) -> bool {
        self.end_at < now
    }
}
