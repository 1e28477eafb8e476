use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::job::JobStage;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
///
/// The `retryable` flag decides whether the sender is told to redeliver
/// (`503`) or to give up (`422`).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Adapter error: {message}")]
    Adapter { message: String, retryable: bool },

    #[error("Processing failed at {stage}: {message}")]
    Processing {
        stage: JobStage,
        message: String,
        retryable: bool,
    },

    #[error("{service} error: {message}")]
    ExternalService {
        service: String,
        message: String,
        retryable: bool,
    },

    #[error("Security error: {0}")]
    Security(String),

    #[error("Rate limit exceeded")]
    RateLimited { limit: u32, retry_after_secs: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn adapter(message: impl Into<String>, retryable: bool) -> Self {
        AppError::Adapter {
            message: message.into(),
            retryable,
        }
    }

    pub fn external(service: &str, message: impl Into<String>, retryable: bool) -> Self {
        AppError::ExternalService {
            service: service.to_string(),
            message: message.into(),
            retryable,
        }
    }

    /// Whether the sender should redeliver the event later.
    pub fn retryable(&self) -> bool {
        match self {
            AppError::Validation(_) | AppError::Security(_) | AppError::NotFound(_) => false,
            AppError::Adapter { retryable, .. }
            | AppError::Processing { retryable, .. }
            | AppError::ExternalService { retryable, .. } => *retryable,
            AppError::RateLimited { .. } => true,
            AppError::Database(_) => true,
            AppError::Internal(_) => false,
        }
    }

    /// Re-tags an error raised inside a pipeline stage, keeping its retryability.
    pub fn at_stage(self, stage: JobStage) -> Self {
        match self {
            AppError::Processing { .. } => self,
            other => AppError::Processing {
                stage,
                retryable: other.retryable(),
                message: other.to_string(),
            },
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            AppError::Security(_) => (StatusCode::UNAUTHORIZED, "SECURITY_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Database(_) => (StatusCode::SERVICE_UNAVAILABLE, "DATABASE_ERROR"),
            AppError::Adapter { retryable, .. } => transient_or(*retryable, "ADAPTER_ERROR"),
            AppError::Processing { retryable, .. } => transient_or(*retryable, "PROCESSING_ERROR"),
            AppError::ExternalService { retryable, .. } => {
                transient_or(*retryable, "EXTERNAL_SERVICE_ERROR")
            }
        }
    }

    /// Message safe to show to the caller. Storage and internal failures are masked.
    fn public_message(&self) -> String {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                "A database error occurred".to_string()
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                "An internal server error occurred".to_string()
            }
            other => other.to_string(),
        }
    }

    fn to_response(&self, job_id: Option<Uuid>) -> Response {
        let (status, code) = self.status_and_code();
        let mut body = json!({
            "error": self.public_message(),
            "code": code,
            "retryable": self.retryable(),
        });
        if let Some(id) = job_id {
            body["job_id"] = json!(id);
        }

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited {
            limit,
            retry_after_secs,
        } = self
        {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(*limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("Retry-After", HeaderValue::from(*retry_after_secs));
        }
        response
    }
}

fn transient_or(retryable: bool, code: &'static str) -> (StatusCode, &'static str) {
    if retryable {
        (StatusCode::SERVICE_UNAVAILABLE, code)
    } else {
        (StatusCode::UNPROCESSABLE_ENTITY, code)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.to_response(None)
    }
}

/// A terminal pipeline failure, tagged with the job that recorded it.
/// `job_id` is `None` when the failure happened before a job row existed.
#[derive(Debug, Error)]
#[error("pipeline failed: {source}")]
pub struct PipelineError {
    pub job_id: Option<Uuid>,
    #[source]
    pub source: AppError,
}

impl PipelineError {
    pub fn unrecorded(source: AppError) -> Self {
        Self {
            job_id: None,
            source,
        }
    }

    pub fn retryable(&self) -> bool {
        self.source.retryable()
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        self.source.to_response(self.job_id)
    }
}

/// Renders an error and its `source()` chain, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![err.to_string()];
    let mut current = err.source();
    while let Some(cause) = current {
        lines.push(format!("caused by: {cause}"));
        current = cause.source();
    }
    lines.join("\n")
}
