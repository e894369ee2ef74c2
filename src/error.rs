use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Browser process could not start. Configuration problem, not transient.
    #[error("Browser launch error: {0}")]
    BrowserLaunch(String),

    #[error("Failed to load the website: {0}")]
    Navigation(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scrape run aborted before completing")]
    RunAborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Store write failures, classified from the backend error.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Table \"scrape_runs\" does not exist. Please run the migrations first.")]
    SchemaMissing,

    #[error("Database permission error: {0}")]
    PermissionDenied(String),

    #[error("Database write error: {0}")]
    Other(sqlx::Error),
}

impl AppError {
    /// Whether a failed run should be retried after the short retry delay
    /// rather than waiting out the full update interval.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AppError::BrowserLaunch(_) | AppError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// `{success: false, error}` envelope shared by every failing response.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": message.into(),
        })),
    )
        .into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
    }
}
