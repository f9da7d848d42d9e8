//! User-facing messages per error code.
//!
//! Kept as data: one `(code, message)` pair per entry and a required
//! fallback for anything the table does not name.

use crate::error::{ErrorBody, ErrorCode};

pub const DEFAULT_MESSAGE: &str = "Something went wrong. Please try again in a moment.";

/// Shown when no response arrived at all.
pub const NETWORK_MESSAGE: &str = "We couldn't reach the server. Please try again.";

const MESSAGES: &[(ErrorCode, &str)] = &[
    (ErrorCode::ValidationError, "Please check what you entered and try again."),
    (ErrorCode::AuthRequired, "Please sign in to continue."),
    (ErrorCode::Forbidden, "You don't have permission to do that."),
    (ErrorCode::FundingNotFound, "This funding no longer exists."),
    (ErrorCode::CartItemNotFound, "This item is no longer in your cart."),
    (ErrorCode::OrderNotFound, "We couldn't find that order."),
    (ErrorCode::WalletNotFound, "We couldn't find your wallet."),
    (ErrorCode::PaymentNotFound, "We couldn't find that payment."),
    (ErrorCode::WishItemNotFound, "This wish item no longer exists."),
    (ErrorCode::Conflict, "This action isn't available right now."),
    (ErrorCode::FundingNotContributable, "This funding has already ended."),
    (ErrorCode::ExceedTarget, "The amount is larger than the funding goal."),
    (ErrorCode::ExceedRemainingAmount, "The amount is larger than what's left to fund."),
    (ErrorCode::InsufficientBalance, "Your wallet balance is too low. Please top up first."),
    (ErrorCode::AmountMismatch, "The paid amount didn't match the request. No money was moved."),
    (ErrorCode::ChargeFailed, "Your top-up couldn't be completed."),
    (ErrorCode::PaymentFailed, "The payment couldn't be completed."),
];

pub fn user_message(code: ErrorCode) -> &'static str {
    MESSAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, msg)| *msg)
        .unwrap_or(DEFAULT_MESSAGE)
}

/// Render a server error body. Overshoot errors append the remaining amount
/// when the server supplied it.
pub fn render(body: &ErrorBody) -> String {
    let Some(code) = body.error_code() else {
        return DEFAULT_MESSAGE.to_string();
    };
    let base = user_message(code);
    let remaining = body
        .details
        .as_ref()
        .and_then(|d| d.get("remainingAmount"))
        .and_then(|v| v.as_i64());
    match (code, remaining) {
        (ErrorCode::ExceedRemainingAmount, Some(remaining)) => {
            format!("{base} You can contribute up to {remaining}.")
        }
        _ => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn every_code_but_server_error_has_a_message() {
        for code in ErrorCode::ALL {
            let msg = user_message(code);
            if code == ErrorCode::ServerError {
                assert_eq!(msg, DEFAULT_MESSAGE);
            } else {
                assert_ne!(msg, DEFAULT_MESSAGE, "{code:?} has no message");
            }
        }
    }

    #[test]
    fn unknown_code_falls_back() {
        let body = ErrorBody {
            code: "SOMETHING_NEW".to_string(),
            message: "x".to_string(),
            details: None,
        };
        assert_eq!(render(&body), DEFAULT_MESSAGE);
    }

    #[test]
    fn remaining_amount_is_rendered() {
        let body = ErrorBody {
            code: "EXCEED_REMAINING_AMOUNT".to_string(),
            message: "x".to_string(),
            details: Some(json!({ "remainingAmount": 40000 })),
        };
        assert!(render(&body).ends_with("You can contribute up to 40000."));
    }
}
