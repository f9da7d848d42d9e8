//! Error taxonomy shared by the service and its clients.
//!
//! [`ErrorCode`] is the closed set of machine-readable codes that cross the
//! wire. [`DomainError`] is what rule checks return; each variant maps to
//! exactly one code and may carry display details (e.g. the remaining amount
//! of a funding).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::FundingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    AuthRequired,
    Forbidden,
    FundingNotFound,
    CartItemNotFound,
    OrderNotFound,
    WalletNotFound,
    PaymentNotFound,
    WishItemNotFound,
    Conflict,
    FundingNotContributable,
    ExceedTarget,
    ExceedRemainingAmount,
    InsufficientBalance,
    AmountMismatch,
    ChargeFailed,
    PaymentFailed,
    ServerError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 18] = [
        Self::ValidationError,
        Self::AuthRequired,
        Self::Forbidden,
        Self::FundingNotFound,
        Self::CartItemNotFound,
        Self::OrderNotFound,
        Self::WalletNotFound,
        Self::PaymentNotFound,
        Self::WishItemNotFound,
        Self::Conflict,
        Self::FundingNotContributable,
        Self::ExceedTarget,
        Self::ExceedRemainingAmount,
        Self::InsufficientBalance,
        Self::AmountMismatch,
        Self::ChargeFailed,
        Self::PaymentFailed,
        Self::ServerError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::FundingNotFound => "FUNDING_NOT_FOUND",
            Self::CartItemNotFound => "CART_ITEM_NOT_FOUND",
            Self::OrderNotFound => "ORDER_NOT_FOUND",
            Self::WalletNotFound => "WALLET_NOT_FOUND",
            Self::PaymentNotFound => "PAYMENT_NOT_FOUND",
            Self::WishItemNotFound => "WISH_ITEM_NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::FundingNotContributable => "FUNDING_NOT_CONTRIBUTABLE",
            Self::ExceedTarget => "EXCEED_TARGET",
            Self::ExceedRemainingAmount => "EXCEED_REMAINING_AMOUNT",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::AmountMismatch => "AMOUNT_MISMATCH",
            Self::ChargeFailed => "CHARGE_FAILED",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::ServerError => "SERVER_ERROR",
        }
    }

    /// Parse a wire code. Unknown codes yield `None` so callers can fall
    /// back to a generic message.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Whether the client should offer a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServerError)
    }
}

/// A rule violation raised by the domain layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid input: {0}")]
    Validation(String),

    /// One line of a checkout broke a rule; the whole request is invalid.
    #[error("invalid input: cart item {cart_item_id}: {source}")]
    InvalidCartLine {
        cart_item_id: i64,
        source: Box<DomainError>,
    },

    #[error("contribution must be at least {minimum}")]
    BelowMinimum { minimum: i64 },

    #[error("authentication required")]
    AuthRequired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("funding {0} not found")]
    FundingNotFound(i64),

    #[error("cart item {0} not found")]
    CartItemNotFound(i64),

    #[error("order {0} not found")]
    OrderNotFound(i64),

    #[error("wallet for member {0} not found")]
    WalletNotFound(i64),

    #[error("payment {0} not found")]
    PaymentNotFound(i64),

    #[error("wish item {0} not found")]
    WishItemNotFound(i64),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("funding {funding_id} is {status} and no longer accepts contributions")]
    FundingNotContributable {
        funding_id: i64,
        status: FundingStatus,
    },

    #[error("contribution exceeds the funding target of {target}")]
    ExceedTarget { target: i64 },

    #[error("contribution exceeds the remaining amount of {remaining}")]
    ExceedRemainingAmount { remaining: i64 },

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: i64, required: i64 },

    #[error("amount mismatch: requested {expected}, confirmed {actual}")]
    AmountMismatch { expected: i64, actual: i64 },

    #[error("charge failed ({code}): {message}")]
    ChargeFailed { code: String, message: String },

    #[error("payment failed: {0}")]
    PaymentFailed(String),
}

impl DomainError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::InvalidCartLine { .. } | Self::BelowMinimum { .. } => {
                ErrorCode::ValidationError
            }
            Self::AuthRequired => ErrorCode::AuthRequired,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::FundingNotFound(_) => ErrorCode::FundingNotFound,
            Self::CartItemNotFound(_) => ErrorCode::CartItemNotFound,
            Self::OrderNotFound(_) => ErrorCode::OrderNotFound,
            Self::WalletNotFound(_) => ErrorCode::WalletNotFound,
            Self::PaymentNotFound(_) => ErrorCode::PaymentNotFound,
            Self::WishItemNotFound(_) => ErrorCode::WishItemNotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::FundingNotContributable { .. } => ErrorCode::FundingNotContributable,
            Self::ExceedTarget { .. } => ErrorCode::ExceedTarget,
            Self::ExceedRemainingAmount { .. } => ErrorCode::ExceedRemainingAmount,
            Self::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            Self::AmountMismatch { .. } => ErrorCode::AmountMismatch,
            Self::ChargeFailed { .. } => ErrorCode::ChargeFailed,
            Self::PaymentFailed(_) => ErrorCode::PaymentFailed,
        }
    }

    /// Structured values the client needs to render the error.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::BelowMinimum { minimum } => Some(json!({ "minimumAmount": minimum })),
            Self::ExceedTarget { target } => Some(json!({ "targetAmount": target })),
            Self::ExceedRemainingAmount { remaining } => {
                Some(json!({ "remainingAmount": remaining }))
            }
            Self::InsufficientBalance { balance, required } => {
                Some(json!({ "balance": balance, "requiredAmount": required }))
            }
            Self::AmountMismatch { expected, actual } => {
                Some(json!({ "expectedAmount": expected, "actualAmount": actual }))
            }
            Self::FundingNotContributable { funding_id, status } => {
                Some(json!({ "fundingId": funding_id, "status": status }))
            }
            Self::ChargeFailed { code, .. } => Some(json!({ "gatewayCode": code })),
            Self::InvalidCartLine {
                cart_item_id,
                source,
            } => {
                let mut details = json!({ "cartItemId": cart_item_id, "reason": source.code() });
                if let (Value::Object(map), Some(Value::Object(inner))) =
                    (&mut details, source.details())
                {
                    map.extend(inner);
                }
                Some(details)
            }
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().as_str().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

/// Wire shape of every error response: `{code, message, details?}`.
///
/// `code` stays a string so a client built against an older code list can
/// still decode responses carrying newer codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorBody {
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(&self.code)
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
