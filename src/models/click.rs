use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One redirect, as published to the click log queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub short_code: String,
    pub long_url: String,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub referer: String,
    pub headers: BTreeMap<String, Vec<String>>,
    /// Unix seconds
    pub observed_at: i64,
}

impl ClickEvent {
    /// Headers as the JSON string stored in the click log
    pub fn headers_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.headers)
    }
}
