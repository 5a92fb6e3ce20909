use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Which quota a rate-limited request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Session,
    Portal,
}

impl QuotaScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaScope::Session => "session",
            QuotaScope::Portal => "portal",
        }
    }
}

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Capability '{capability}' denied")]
    CapabilityDenied { capability: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Rate limit exceeded for {} quota, resets at {reset_at}", .scope.as_str())]
    RateLimitExceeded {
        scope: QuotaScope,
        reset_at: DateTime<Utc>,
    },

    #[error("{dependency} unavailable: {message}")]
    TransientDependency {
        dependency: &'static str,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn transient(dependency: &'static str, message: impl Into<String>) -> Self {
        AppError::TransientDependency {
            dependency,
            message: message.into(),
        }
    }

    pub fn timeout(dependency: &'static str, budget: std::time::Duration) -> Self {
        AppError::TransientDependency {
            dependency,
            message: format!("timed out after {}ms", budget.as_millis()),
        }
    }

    /// Whether the component owning the failed call may try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransientDependency { .. } => true,
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Stable machine-readable code, shared by HTTP bodies and stored run errors.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::CapabilityDenied { .. } => "CAPABILITY_DENIED",
            AppError::StateConflict(_) => "STATE_CONFLICT",
            AppError::RateLimitExceeded { .. } => "RATE_LIMITED",
            AppError::TransientDependency { .. } => "DEPENDENCY_UNAVAILABLE",
            AppError::Cancelled => "CANCELLED",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Llm(_) => "LLM_ERROR",
            AppError::S3(_) => "S3_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::CapabilityDenied { .. } => (
                StatusCode::FORBIDDEN,
                "Your plan does not include portals".to_string(),
            ),
            AppError::StateConflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many messages, please wait before asking again".to_string(),
            ),
            AppError::TransientDependency {
                dependency,
                message,
            } => {
                tracing::warn!("Dependency {dependency} unavailable: {message}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "A dependency is temporarily unavailable, please retry".to_string(),
                )
            }
            AppError::Cancelled => (StatusCode::CONFLICT, "Operation cancelled".to_string()),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A database error occurred".to_string(),
                )
            }
            AppError::Llm(msg) => {
                tracing::error!("LLM error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An AI processing error occurred".to_string(),
                )
            }
            AppError::S3(msg) => {
                tracing::error!("S3 error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A storage error occurred".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let mut error = json!({
            "code": code,
            "message": message,
        });
        if let AppError::RateLimitExceeded { scope, reset_at } = &self {
            error["scope"] = json!(scope);
            error["reset_at"] = json!(reset_at);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(AppError::transient("embedding", "503").is_retryable());
        assert!(AppError::timeout("completion", std::time::Duration::from_secs(1)).is_retryable());
        assert!(!AppError::Validation("bad".into()).is_retryable());
        assert!(!AppError::StateConflict("busy".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
        assert!(!AppError::CapabilityDenied {
            capability: "portal".into()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_response_carries_reset_time() {
        let reset_at = Utc::now();
        let response = AppError::RateLimitExceeded {
            scope: QuotaScope::Session,
            reset_at,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "RATE_LIMITED");
        assert_eq!(value["error"]["scope"], "session");
        assert!(value["error"]["reset_at"].is_string());
    }

    #[tokio::test]
    async fn test_internal_details_are_not_exposed() {
        let response = AppError::Llm("upstream said: secret prompt".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("secret prompt"));
    }
}
