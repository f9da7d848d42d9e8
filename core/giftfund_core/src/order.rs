//! Order lifecycle and checkout helpers.
//!
//! ```text
//! Created ──► Canceled (never paid)
//! Created ──► Paid ──► Confirmed
//!               │  └──► PartialConfirmed
//!               ├──► Canceling ──► Canceled
//!               └──► PartialCanceling ──► PartialCanceled
//! Confirmed ──► Canceling / PartialCanceling
//! ```

use std::collections::BTreeSet;

use crate::error::{DomainError, Result};
use crate::types::{OrderItemStatus, OrderStatus};

impl OrderStatus {
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, Paid)
                | (Created, Canceled)
                | (Paid, Confirmed)
                | (Paid, PartialConfirmed)
                | (Paid, Canceling)
                | (Paid, PartialCanceling)
                | (Confirmed, Canceling)
                | (Confirmed, PartialCanceling)
                | (Canceling, Canceled)
                | (PartialCanceling, PartialCanceled)
        )
    }

    /// Check a transition and return the target status.
    pub fn transition(&self, next: OrderStatus) -> Result<OrderStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::Conflict(format!(
                "order cannot move from {self} to {next}"
            )))
        }
    }
}

impl OrderItemStatus {
    /// Item-level status mirrored from an order-level status.
    pub fn mirror(order: OrderStatus) -> Self {
        match order {
            OrderStatus::Created => Self::Created,
            OrderStatus::Paid => Self::Paid,
            OrderStatus::Confirmed | OrderStatus::PartialConfirmed => Self::Confirmed,
            OrderStatus::Canceling | OrderStatus::PartialCanceling => Self::Canceling,
            OrderStatus::Canceled | OrderStatus::PartialCanceled => Self::Canceled,
        }
    }
}

/// Canonical identity of a checkout request: the sorted set of cart item ids.
///
/// Rejects empty requests and repeated ids, so two requests with the same
/// fingerprint always name exactly the same cart snapshot.
pub fn cart_fingerprint(cart_item_ids: &[i64]) -> Result<String> {
    if cart_item_ids.is_empty() {
        return Err(DomainError::Validation(
            "at least one cart item is required".to_string(),
        ));
    }
    let unique: BTreeSet<i64> = cart_item_ids.iter().copied().collect();
    if unique.len() != cart_item_ids.len() {
        return Err(DomainError::Validation(
            "cart item ids must not repeat".to_string(),
        ));
    }
    Ok(unique
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(","))
}
