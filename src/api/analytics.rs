//! Chart endpoints: account click totals, hourly clicks for today,
//! per-link stats and campaign series.

use axum::extract::{Path, RawQuery, State};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::handlers::single_param;
use super::response::{ApiError, ApiResponse, ApiResult};
use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::timeseries::{day_key, Point};

const SECONDS_PER_DAY: i64 = 86_400;
const MONTH_DAYS: i64 = 31;

#[derive(Debug, Serialize)]
pub struct Dataset {
    pub label: String,
    pub fill: bool,
    pub data: Vec<u64>,
}

/// Chart payload: one label per x value, one or more series
#[derive(Debug, Serialize)]
pub struct DataResponse {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
}

impl DataResponse {
    fn single(label: &str, labels: Vec<String>, data: Vec<u64>) -> Self {
        Self {
            labels,
            datasets: vec![Dataset {
                label: label.to_string(),
                fill: false,
                data,
            }],
        }
    }

    fn from_counts(label: &str, counts: BTreeMap<String, u64>) -> Self {
        let (labels, data) = counts.into_iter().unzip();
        Self::single(label, labels, data)
    }
}

#[derive(Debug, Serialize)]
pub struct LinkStat {
    pub clicks: DataResponse,
    pub referrers: DataResponse,
    pub locations: DataResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSeries {
    pub short_url: String,
    pub data: Vec<Point>,
}

/// RFC3339, or a bare `YYYY-MM-DD` read as UTC midnight
pub fn parse_time(value: &str) -> Result<i64, ApiError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.timestamp());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp())
        .ok_or_else(|| ApiError::bad_request(format!("invalid time {value:?}")))
}

fn optional_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn month_start(now: DateTime<Utc>) -> i64 {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .map(|start| start.timestamp())
        .unwrap_or_else(|| now.timestamp() - now.timestamp().rem_euclid(SECONDS_PER_DAY))
}

/// GET /api/v1/users/links/clicks/total
pub async fn clicks_total(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
) -> ApiResult<i64> {
    Ok(ApiResponse(state.storage.total_clicks(claims.account_id).await?))
}

/// GET /api/v1/users/links/clicks/data
pub async fn clicks_data(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
) -> ApiResult<DataResponse> {
    let now = Utc::now().timestamp();
    let day_start = now - now.rem_euclid(SECONDS_PER_DAY);
    let times = state
        .storage
        .click_times(claims.account_id, day_start, day_start + SECONDS_PER_DAY)
        .await?;

    let mut hours = vec![0u64; 24];
    for ts in times {
        if let Some(at) = DateTime::from_timestamp(ts, 0) {
            hours[at.hour() as usize] += 1;
        }
    }
    let labels = (0..24).map(|hour| format!("{hour:02}:00")).collect();
    Ok(ApiResponse(DataResponse::single("clicks", labels, hours)))
}

/// GET /api/v1/users/links/{code}/stat?start=&end=
///
/// Without a range the current month is returned under a 31 day override;
/// an explicit range is bounded by the account's `timedata_limit`.
pub async fn link_stat(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    Path(code): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<LinkStat> {
    let start = optional_param(query.as_deref(), "start");
    let end = optional_param(query.as_deref(), "end");
    let (start, end, limit) = match (start, end) {
        (None, None) => {
            let start = month_start(Utc::now());
            (start, start + (MONTH_DAYS - 1) * SECONDS_PER_DAY, Some(MONTH_DAYS))
        }
        (Some(start), Some(end)) => (parse_time(&start)?, parse_time(&end)?, None),
        _ => return Err(ApiError::bad_request("start and end must be given together")),
    };
    if end < start {
        return Err(ApiError::bad_request("end is before start"));
    }

    let points = state
        .timeseries
        .query(claims.account_id, &code, start, end, limit)
        .await?;
    let by_day: BTreeMap<String, u64> = points.into_iter().map(|p| (p.time, p.count)).collect();

    let mut labels = Vec::new();
    let mut clicks = Vec::new();
    let mut day = start - start.rem_euclid(SECONDS_PER_DAY);
    while day <= end {
        let key = day_key(day)?;
        clicks.push(by_day.get(&key).copied().unwrap_or(0));
        if let Some(at) = DateTime::from_timestamp(day, 0) {
            labels.push(at.format("%m-%d").to_string());
        }
        day += SECONDS_PER_DAY;
    }

    let rows = state
        .storage
        .link_breakdown(&code, start, end + SECONDS_PER_DAY)
        .await?;
    let mut referrers = BTreeMap::new();
    let mut locations = BTreeMap::new();
    for row in rows {
        let referer = if row.referer.is_empty() {
            "direct".to_string()
        } else {
            row.referer
        };
        *referrers.entry(referer).or_insert(0u64) += row.count as u64;
        let country = row.country.unwrap_or_else(|| "unknown".to_string());
        *locations.entry(country).or_insert(0u64) += row.count as u64;
    }

    Ok(ApiResponse(LinkStat {
        clicks: DataResponse::single("clicks", labels, clicks),
        referrers: DataResponse::from_counts("referrers", referrers),
        locations: DataResponse::from_counts("locations", locations),
    }))
}

/// GET /api/v1/campaigns/data?campaignId=&start=&end=
pub async fn campaign_data(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    RawQuery(query): RawQuery,
) -> ApiResult<Vec<CampaignSeries>> {
    let query = query.as_deref();
    let campaign_id: i64 = single_param(query, "campaignId")?
        .parse()
        .map_err(|_| ApiError::bad_request("campaignID is not number"))?;
    let start = parse_time(&single_param(query, "start")?)?;
    let end = parse_time(&single_param(query, "end")?)?;
    if end < start {
        return Err(ApiError::bad_request("end is before start"));
    }

    let links = state
        .storage
        .campaign_links(claims.account_id, campaign_id)
        .await?;

    let mut series = Vec::with_capacity(links.len());
    for link in links {
        let data = state
            .timeseries
            .query(claims.account_id, &link.short_code, start, end, None)
            .await?;
        series.push(CampaignSeries {
            short_url: link.short_code,
            data,
        });
    }
    Ok(ApiResponse(series))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_accepts_dates_and_rfc3339() {
        assert_eq!(parse_time("2024-01-02").unwrap(), 1_704_153_600);
        assert_eq!(parse_time("2024-01-02T00:00:00Z").unwrap(), 1_704_153_600);
        assert_eq!(parse_time("2024-01-02T02:00:00+02:00").unwrap(), 1_704_153_600);
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_month_start() {
        let now = Utc.with_ymd_and_hms(2024, 2, 17, 13, 5, 0).unwrap();
        assert_eq!(month_start(now), parse_time("2024-02-01").unwrap());
    }
}
