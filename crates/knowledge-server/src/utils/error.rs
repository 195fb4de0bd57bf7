use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Duplicate doc type: {0}")]
    DuplicateDocType(String),

    #[error("Invalid doc type: {0}")]
    InvalidDocType(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Rate limited: retry after {retry_after_secs}s ({reason})")]
    RateLimited {
        retry_after_secs: u64,
        reason: String,
    },

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider contract violation: {0}")]
    ProviderContractViolation(String),

    #[error("Storage error: {0}")]
    StorageFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code carried in every error response.
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::InvalidArgument(_) => "InvalidArgument",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::DuplicateDocType(_) => "DuplicateDocType",
            ApiError::InvalidDocType(_) => "InvalidDocType",
            ApiError::ValidationFailed(_) => "ValidationFailed",
            ApiError::RateLimited { .. } => "RateLimited",
            ApiError::CircuitOpen(_) => "CircuitOpen",
            ApiError::Timeout(_) => "Timeout",
            ApiError::Cancelled(_) => "Cancelled",
            ApiError::ProviderUnavailable(_) => "ProviderUnavailable",
            ApiError::ProviderContractViolation(_) => "ProviderContractViolation",
            ApiError::StorageFailed(_) => "StorageFailed",
            ApiError::Internal(_) => "Internal",
        }
    }

    /// Retry-eligible failures: network/timeout kinds, plus anything the
    /// provider reports in wording that marks a transient condition.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Timeout(_) | ApiError::ProviderUnavailable(_) => true,
            ApiError::StorageFailed(msg) | ApiError::Internal(msg) => is_transient_message(msg),
            _ => false,
        }
    }
}

/// Message-level classification used when the error kind alone is not enough
/// (drivers and providers report transient failures as opaque strings).
pub fn is_transient_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    ["connection", "timeout", "unavailable", "temporarily"]
        .iter()
        .any(|needle| msg.contains(needle))
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            ApiError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };

        let status = match &self {
            ApiError::InvalidArgument(msg) | ApiError::InvalidDocType(msg) => {
                tracing::warn!("Bad request: {}", msg);
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                StatusCode::NOT_FOUND
            }
            ApiError::Conflict(msg) | ApiError::DuplicateDocType(msg) => {
                tracing::warn!("Conflict: {}", msg);
                StatusCode::CONFLICT
            }
            ApiError::ValidationFailed(msg) => {
                tracing::warn!("Validation failed: {}", msg);
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::RateLimited { reason, .. } => {
                tracing::warn!("Rate limited: {}", reason);
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::CircuitOpen(msg) | ApiError::ProviderUnavailable(msg) => {
                tracing::error!("Upstream unavailable: {}", msg);
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Timeout(msg) => {
                tracing::error!("Timeout: {}", msg);
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Cancelled(msg) => {
                tracing::warn!("Cancelled: {}", msg);
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::ProviderContractViolation(msg) => {
                tracing::error!("Provider contract violation: {}", msg);
                StatusCode::BAD_GATEWAY
            }
            ApiError::StorageFailed(msg) => {
                tracing::error!("Storage error: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: self.error_code().to_string(),
            retry_after_secs: retry_after,
        });

        (status, body).into_response()
    }
}
