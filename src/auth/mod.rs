//! Bearer token auth for the admin API.
//!
//! Tokens are HS256 JWTs carrying the account, user and role of the caller.
//! A route declares the permission it needs; staff users must hold it
//! through their role, account owners always pass for their own account.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::AuthConfig;
use crate::storage::Storage;

pub const TOKEN_FIELD: &str = "x-access-token";

pub mod permissions {
    pub const LINKS_READ: &str = "links:read";
    pub const LINKS_WRITE: &str = "links:write";
    pub const STATS_READ: &str = "stats:read";
    pub const CAMPAIGNS_READ: &str = "campaigns:read";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub account_id: i64,
    pub user_id: i64,
    pub role_id: i64,
    pub is_staff: bool,
    /// Unix seconds
    pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access token is missing")]
    Missing,
    #[error("invalid access token: {0}")]
    Invalid(String),
    #[error("access denied")]
    Forbidden,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::Missing | AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::Invalid(_) => StatusCode::BAD_REQUEST,
            AuthError::Other(err) => {
                error!(error = %err, "permission lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    token_ttl: Duration,
    storage: Arc<dyn Storage>,
    permissions: Cache<(i64, String), bool>,
}

impl AuthService {
    pub fn new(config: &AuthConfig, storage: Arc<dyn Storage>) -> Self {
        let secret = config.secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            token_ttl: Duration::from_secs(config.token_ttl_secs),
            storage,
            permissions: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(config.permission_cache_ttl_secs))
                .build(),
        }
    }

    /// Sign a token that expires `token_ttl` from now
    pub fn issue(
        &self,
        account_id: i64,
        user_id: i64,
        role_id: i64,
        is_staff: bool,
    ) -> Result<String, AuthError> {
        let exp = chrono::Utc::now().timestamp() as u64 + self.token_ttl.as_secs();
        let claims = Claims {
            account_id,
            user_id,
            role_id,
            is_staff,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Other(err.into()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| AuthError::Invalid(err.to_string()))
    }

    pub async fn authorize(&self, claims: &Claims, permission: &str) -> Result<(), AuthError> {
        if !claims.is_staff {
            return Ok(());
        }

        let key = (claims.role_id, permission.to_string());
        let allowed = match self.permissions.get(&key).await {
            Some(allowed) => allowed,
            None => {
                let allowed = self
                    .storage
                    .role_has_permission(claims.role_id, permission)
                    .await?;
                self.permissions.insert(key, allowed).await;
                allowed
            }
        };

        if allowed {
            Ok(())
        } else {
            debug!(role_id = claims.role_id, permission, "permission denied");
            Err(AuthError::Forbidden)
        }
    }
}

/// Header first, then the query string
pub fn token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(TOKEN_FIELD).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| key == TOKEN_FIELD && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Route guard state: who validates, and what the route needs
#[derive(Clone)]
pub struct RequirePermission {
    pub auth: Arc<AuthService>,
    pub permission: &'static str,
}

pub async fn require_permission(
    State(guard): State<RequirePermission>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let (mut parts, body) = request.into_parts();
    let token = token_from_parts(&parts).ok_or(AuthError::Missing)?;
    let claims = guard.auth.verify(&token)?;
    guard.auth.authorize(&claims, guard.permission).await?;

    parts.extensions.insert(claims);
    Ok(next.run(Request::from_parts(parts, body)).await)
}

/// The verified caller. Rejects with 403 when no guard ran.
pub struct CurrentUser(pub Claims);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .cloned()
            .map(CurrentUser)
            .ok_or(AuthError::Forbidden)
    }
}
