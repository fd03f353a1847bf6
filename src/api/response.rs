use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;
use crate::billing::LimiterError;
use crate::links::MintError;
use crate::storage::StorageError;
use crate::timeseries::TimeSeriesError;

/// Success envelope: `{"result": ...}`
pub struct ApiResponse<T>(pub T);

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(json!({ "result": self.0 })).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("plan limit exceeded")]
    LimitExceeded,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Auth(err) = self {
            return err.into_response();
        }

        let status = match &self {
            ApiError::BadRequest(_) | ApiError::LimitExceeded => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Auth(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(message) => {
                error!(error = %message, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err)
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound => ApiError::NotFound("link not found".to_string()),
            StorageError::Conflict => ApiError::bad_request(err.to_string()),
            StorageError::Other(err) => ApiError::internal(err),
        }
    }
}

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::LimitExceeded => ApiError::LimitExceeded,
            other => ApiError::internal(other),
        }
    }
}

impl From<MintError> for ApiError {
    fn from(err: MintError) -> Self {
        match err {
            MintError::EmptyUrl | MintError::InvalidUrl => ApiError::bad_request(err.to_string()),
            MintError::LimitExceeded => ApiError::LimitExceeded,
            MintError::Storage(err) => err.into(),
            other => ApiError::internal(other),
        }
    }
}

impl From<TimeSeriesError> for ApiError {
    fn from(err: TimeSeriesError) -> Self {
        match err {
            TimeSeriesError::NotFound => ApiError::NotFound("link not found".to_string()),
            TimeSeriesError::LimitExceeded => ApiError::LimitExceeded,
            TimeSeriesError::Limiter(err) => err.into(),
            other => ApiError::internal(other),
        }
    }
}
