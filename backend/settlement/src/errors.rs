//! Application-wide error types.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use giftfund_core::{types::UnknownVariant, DomainError, ErrorBody, ErrorCode};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt record: {0}")]
    Corrupt(#[from] UnknownVariant),
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Domain(e) => e.code(),
            _ => ErrorCode::ServerError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::FundingNotFound
            | ErrorCode::CartItemNotFound
            | ErrorCode::OrderNotFound
            | ErrorCode::WalletNotFound
            | ErrorCode::PaymentNotFound
            | ErrorCode::WishItemNotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict | ErrorCode::FundingNotContributable => StatusCode::CONFLICT,
            ErrorCode::ExceedTarget
            | ErrorCode::ExceedRemainingAmount
            | ErrorCode::InsufficientBalance
            | ErrorCode::AmountMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::ChargeFailed | ErrorCode::PaymentFailed => StatusCode::PAYMENT_REQUIRED,
            ErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Domain(e) => e.to_body(),
            _ => ErrorBody {
                code: ErrorCode::ServerError.as_str().to_string(),
                message: "internal server error".to_string(),
                details: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if !matches!(self, Self::Domain(_)) {
            error!("Request failed: {self}");
        }
        (self.status_code(), Json(self.to_body())).into_response()
    }
}

/// `SQLITE_BUSY` / `SQLITE_LOCKED` and their extended codes.
fn is_lock_contention(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_contention(&err) {
            warn!("Write lock not acquired within the busy timeout: {err}");
            return AppError::Domain(DomainError::Conflict(
                "the resource is busy, please retry".to_string(),
            ));
        }
        AppError::Database(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Domain(DomainError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Domain(DomainError::Validation(rejection.body_text()))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
