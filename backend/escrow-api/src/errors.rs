//! Application-wide error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use milestone_escrow::{ErrorKind, LedgerError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The ledger accounted for a payout but the asset transfer failed.
    #[error("Transfer {reference} failed ({policy}): {message}")]
    Transfer {
        reference: String,
        policy: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Ledger(err) => match err.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidState => StatusCode::CONFLICT,
                ErrorKind::InvariantViolation | ErrorKind::ArithmeticOverflow => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
            },
            Self::Transfer { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ledger(err) => match err.kind() {
                ErrorKind::InvariantViolation => "invariant_violation",
                ErrorKind::NotFound => "not_found",
                ErrorKind::InvalidState => "invalid_state",
                ErrorKind::ArithmeticOverflow => "arithmetic_overflow",
            },
            Self::Transfer { .. } => "transfer_failed",
            _ => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}
