//! Wallet ledger arithmetic.
//!
//! A wallet's balance is the running total of its transaction history.
//! Every transaction snapshots `balance_after`; the snapshots must chain:
//! `entry[n].balance_after == entry[n-1].balance_after + entry[n].amount`.

use thiserror::Error;

use crate::error::{DomainError, Result};
use crate::types::{TransactionType, WalletTransaction};

impl TransactionType {
    /// Sign applied to the magnitude of a transaction of this type.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Charge | Self::Refund => 1,
            Self::Payment | Self::Withdraw => -1,
        }
    }

    /// Signed ledger amount for a positive `magnitude`.
    pub fn signed(&self, magnitude: i64) -> i64 {
        self.sign() * magnitude
    }
}

/// Balance after applying a signed amount. Debits may not go below zero.
pub fn next_balance(balance: i64, signed_amount: i64) -> Result<i64> {
    let next = balance
        .checked_add(signed_amount)
        .ok_or_else(|| DomainError::Validation("balance overflow".to_string()))?;
    if next < 0 {
        return Err(DomainError::InsufficientBalance {
            balance,
            required: -signed_amount,
        });
    }
    Ok(next)
}

/// Largest amount a single wallet transaction may move, in won.
pub const MAX_TRANSACTION_AMOUNT: i64 = 100_000_000_000;

/// Validate a positive, bounded transaction magnitude.
pub fn check_magnitude(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(DomainError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    if amount > MAX_TRANSACTION_AMOUNT {
        return Err(DomainError::Validation(format!(
            "amount may not exceed {MAX_TRANSACTION_AMOUNT}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerViolation {
    #[error("entry {id}: balance_after {actual} but running total is {expected}")]
    BrokenChain { id: i64, expected: i64, actual: i64 },

    #[error("entry {id}: {tx_type} amount {amount} has the wrong sign")]
    WrongSign {
        id: i64,
        tx_type: TransactionType,
        amount: i64,
    },

    #[error("entry {id}: balance went negative ({balance})")]
    Negative { id: i64, balance: i64 },
}

/// Replay a history (oldest first) from zero and return the final balance.
pub fn replay(entries: &[WalletTransaction]) -> std::result::Result<i64, LedgerViolation> {
    let mut running = 0i64;
    for entry in entries {
        if entry.amount == 0 || entry.amount.signum() != entry.tx_type.sign() {
            return Err(LedgerViolation::WrongSign {
                id: entry.id,
                tx_type: entry.tx_type,
                amount: entry.amount,
            });
        }
        running += entry.amount;
        if running < 0 {
            return Err(LedgerViolation::Negative {
                id: entry.id,
                balance: running,
            });
        }
        if entry.balance_after != running {
            return Err(LedgerViolation::BrokenChain {
                id: entry.id,
                expected: running,
                actual: entry.balance_after,
            });
        }
    }
    Ok(running)
}
