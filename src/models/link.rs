use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Link {
    pub id: i64,
    pub short_code: String,
    pub long_url: String,
    pub description: Option<String>,
    pub account_id: i64,
    pub created_at: i64,
    pub hidden: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Filter for listing an account's links.
///
/// Values inside one criterion are OR-ed, criteria are AND-ed. Short and
/// long URLs match by prefix. `full_text` matches a tag, a short prefix or
/// a long prefix.
#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    pub tags: Vec<String>,
    pub short_url: Vec<String>,
    pub long_url: Vec<String>,
    pub full_text: Option<String>,
}

impl LinkFilter {
    /// Build from a raw query string, keeping repeated keys
    pub fn from_query(query: &str) -> Self {
        let mut filter = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "tags" => filter.tags.push(value.into_owned()),
                "shortUrl" => filter.short_url.push(value.into_owned()),
                "longUrl" => filter.long_url.push(value.into_owned()),
                "fullText" => filter.full_text = Some(value.into_owned()),
                _ => {}
            }
        }
        filter
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Utm {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CampaignLink {
    pub campaign_id: i64,
    pub short_code: String,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
}
