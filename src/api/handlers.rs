use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use super::response::{ApiError, ApiResponse, ApiResult};
use crate::app::AppState;
use crate::auth::CurrentUser;
use crate::models::{CreateLinkRequest, Link, LinkFilter};

/// A link with its tags, as listed to its owner
#[derive(Debug, Serialize)]
pub struct LinkView {
    #[serde(flatten)]
    pub link: Link,
    pub tags: Vec<String>,
}

/// The one value of a query parameter. Missing or repeated parameters are
/// rejected.
pub fn single_param(query: Option<&str>, name: &str) -> Result<String, ApiError> {
    let values: Vec<String> = url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .filter(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .collect();

    match <[String; 1]>::try_from(values) {
        Ok([value]) => Ok(value),
        Err(_) => Err(ApiError::bad_request(format!(
            "invalid number of query values for parameter {name}, must be 1"
        ))),
    }
}

fn short_url(state: &AppState, headers: &HeaderMap, code: &str) -> String {
    let base = match &state.public_base_url {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        }
    };
    format!("{base}/{code}")
}

async fn with_tags(state: &AppState, links: Vec<Link>) -> Result<Vec<LinkView>, ApiError> {
    let mut views = Vec::with_capacity(links.len());
    for link in links {
        let tags = state.storage.link_tags(link.id).await?;
        views.push(LinkView { link, tags });
    }
    Ok(views)
}

/// POST /api/v1/urls/create?url=<long>
pub async fn mint_url(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> ApiResult<String> {
    let long_url = single_param(query.as_deref(), "url")?;
    let link = state.links.mint(claims.account_id, &long_url, None).await?;
    Ok(ApiResponse(short_url(&state, &headers, &link.short_code)))
}

/// DELETE /api/v1/urls/remove?url=<code>
pub async fn remove_url(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    RawQuery(query): RawQuery,
) -> ApiResult<&'static str> {
    let code = single_param(query.as_deref(), "url")?;
    state.links.remove(claims.account_id, &code).await?;
    Ok(ApiResponse("removed"))
}

/// GET /api/v1/urls
pub async fn list_urls(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
) -> ApiResult<Vec<Link>> {
    let links = state
        .storage
        .list_links(claims.account_id, &LinkFilter::default())
        .await?;
    Ok(ApiResponse(links))
}

/// POST /api/v1/users/links
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    Json(payload): Json<CreateLinkRequest>,
) -> ApiResult<LinkView> {
    let link = state
        .links
        .mint(claims.account_id, &payload.url, payload.description.as_deref())
        .await?;
    Ok(ApiResponse(LinkView {
        link,
        tags: Vec::new(),
    }))
}

/// GET /api/v1/users/links?tags=&shortUrl=&longUrl=&fullText=
pub async fn list_links(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    RawQuery(query): RawQuery,
) -> ApiResult<Vec<LinkView>> {
    let filter = LinkFilter::from_query(query.as_deref().unwrap_or(""));
    let links = state.storage.list_links(claims.account_id, &filter).await?;
    Ok(ApiResponse(with_tags(&state, links).await?))
}

/// POST /api/v1/users/links/{code}/hide
pub async fn hide_link(
    State(state): State<Arc<AppState>>,
    CurrentUser(claims): CurrentUser,
    Path(code): Path<String>,
) -> ApiResult<&'static str> {
    state.storage.hide_link(claims.account_id, &code).await?;
    Ok(ApiResponse("hidden"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_param() {
        assert_eq!(single_param(Some("url=ex.com%2Fp&x=1"), "url").unwrap(), "ex.com/p");

        for query in [None, Some("x=1"), Some("url=a&url=b")] {
            let err = single_param(query, "url").unwrap_err();
            assert_eq!(
                err.to_string(),
                "invalid number of query values for parameter url, must be 1"
            );
        }
    }
}
