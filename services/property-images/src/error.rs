use crate::provider_client::ProviderError;
use crate::validation::ValidationError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Failures of the fallback orchestrator that escape its recovery rules
#[derive(Debug, Error)]
pub enum ImageServiceError {
    #[error("property {0} has no provider mapping")]
    UnmappedProperty(String),

    #[error("provider property lookup failed: {0:#}")]
    Lookup(anyhow::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The provider rejected an upload and the local fallback failed as well
    #[error("provider upload failed and local fallback failed: {local:#}")]
    UploadFailed {
        remote: ProviderError,
        local: anyhow::Error,
    },

    #[error("no object storage backend configured")]
    StorageNotConfigured,

    #[error("local storage failure: {0:#}")]
    Storage(anyhow::Error),
}

/// Error surfaced to HTTP callers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Too many requests")]
    RateLimited { retry_after: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Property {0} is not linked to the provider")]
    UnmappedProperty(String),

    #[error("Provider request failed")]
    Upstream {
        status: StatusCode,
        details: serde_json::Value,
    },

    #[error("{0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) | ApiError::UnmappedProperty(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "UNAUTHENTICATED",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::UnmappedProperty(_) => "UNMAPPED_PROPERTY",
            ApiError::Upstream { .. } => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<ImageServiceError> for ApiError {
    fn from(err: ImageServiceError) -> Self {
        match err {
            ImageServiceError::UnmappedProperty(id) => ApiError::UnmappedProperty(id),
            ImageServiceError::Provider(provider) => ApiError::Upstream {
                status: provider.status().unwrap_or(StatusCode::BAD_GATEWAY),
                details: provider.details(),
            },
            ImageServiceError::UploadFailed { remote, local } => {
                error!(error = %local, "Local fallback failed after provider upload failure");
                ApiError::Upstream {
                    status: StatusCode::BAD_GATEWAY,
                    details: serde_json::json!({
                        "providerStatus": remote.status().map(|s| s.as_u16()),
                        "providerError": remote.details(),
                    }),
                }
            }
            other @ (ImageServiceError::Lookup(_)
            | ImageServiceError::StorageNotConfigured
            | ImageServiceError::Storage(_)) => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let retry_after = match &self {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let (error, details) = match self {
            ApiError::Upstream { details, .. } => {
                ("Provider request failed".to_string(), Some(details))
            }
            // Internal details stay in the logs
            ApiError::Internal(_) => ("Internal server error".to_string(), None),
            other => (other.to_string(), None),
        };

        let body = ErrorResponse {
            error,
            code,
            details,
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
