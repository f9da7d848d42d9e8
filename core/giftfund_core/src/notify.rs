//! Domain event kinds and the cached views they invalidate.
//!
//! The settlement core writes one event per state change. Consumers (push
//! notification fan-out, client caches, the external refund process)
//! subscribe to those events; the core never depends on a subscriber being
//! available.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FundingCreated,
    FundingParticipated,
    FundingAchieved,
    FundingExpired,
    FundingAccepted,
    /// Trigger for contributor refunds.
    FundingRefused,
    OrderCreated,
    OrderPaid,
    OrderConfirmed,
    OrderCanceled,
    WalletCharged,
    WalletWithdrawn,
    ChargeFailed,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FundingCreated => "funding_created",
            Self::FundingParticipated => "funding_participated",
            Self::FundingAchieved => "funding_achieved",
            Self::FundingExpired => "funding_expired",
            Self::FundingAccepted => "funding_accepted",
            Self::FundingRefused => "funding_refused",
            Self::OrderCreated => "order_created",
            Self::OrderPaid => "order_paid",
            Self::OrderConfirmed => "order_confirmed",
            Self::OrderCanceled => "order_canceled",
            Self::WalletCharged => "wallet_charged",
            Self::WalletWithdrawn => "wallet_withdrawn",
            Self::ChargeFailed => "charge_failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "funding_created" => Self::FundingCreated,
            "funding_participated" => Self::FundingParticipated,
            "funding_achieved" => Self::FundingAchieved,
            "funding_expired" => Self::FundingExpired,
            "funding_accepted" => Self::FundingAccepted,
            "funding_refused" => Self::FundingRefused,
            "order_created" => Self::OrderCreated,
            "order_paid" => Self::OrderPaid,
            "order_confirmed" => Self::OrderConfirmed,
            "order_canceled" => Self::OrderCanceled,
            "wallet_charged" => Self::WalletCharged,
            "wallet_withdrawn" => Self::WalletWithdrawn,
            "charge_failed" => Self::ChargeFailed,
            _ => Self::Unknown,
        }
    }

    /// Entity family the event's `entity_id` refers to.
    pub fn entity_type(&self) -> &'static str {
        match self {
            Self::FundingCreated
            | Self::FundingParticipated
            | Self::FundingAchieved
            | Self::FundingExpired
            | Self::FundingAccepted
            | Self::FundingRefused => "funding",
            Self::OrderCreated | Self::OrderPaid | Self::OrderConfirmed | Self::OrderCanceled => {
                "order"
            }
            Self::WalletCharged | Self::WalletWithdrawn => "wallet",
            Self::ChargeFailed => "payment",
            Self::Unknown => "unknown",
        }
    }
}

/// A client-side view that may hold stale data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachedView {
    Funding(i64),
    FundingParticipants(i64),
    Cart,
    OrderList,
    Order(i64),
    WalletBalance,
    WalletHistory,
}

/// Views to refetch after an event of `kind` about `entity_id`.
pub fn invalidations(kind: EventKind, entity_id: i64) -> Vec<CachedView> {
    use CachedView::*;
    match kind {
        EventKind::FundingCreated => vec![Funding(entity_id), Cart],
        EventKind::FundingParticipated | EventKind::FundingAchieved => {
            vec![Funding(entity_id), FundingParticipants(entity_id), Cart]
        }
        EventKind::FundingExpired | EventKind::FundingAccepted | EventKind::FundingRefused => {
            vec![Funding(entity_id), Cart]
        }
        EventKind::OrderCreated => vec![OrderList, Order(entity_id), Cart],
        EventKind::OrderPaid | EventKind::OrderCanceled => {
            vec![OrderList, Order(entity_id), WalletBalance, WalletHistory]
        }
        EventKind::OrderConfirmed => vec![OrderList, Order(entity_id)],
        EventKind::WalletCharged | EventKind::WalletWithdrawn => {
            vec![WalletBalance, WalletHistory]
        }
        EventKind::ChargeFailed | EventKind::Unknown => Vec::new(),
    }
}

/// Receives invalidations derived from the event stream.
pub trait InvalidationSubscriber {
    fn invalidate(&mut self, view: CachedView);

    fn on_event(&mut self, kind: EventKind, entity_id: i64) {
        for view in invalidations(kind, entity_id) {
            self.invalidate(view);
        }
    }
}
