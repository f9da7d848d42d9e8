//! # Types
//!
//! Shared data structures used across the settlement pipeline.
//!
//! ## Status enums
//!
//! Every status is a closed enum stored as SCREAMING_SNAKE_CASE text. The
//! storage layer reads the text back through [`std::str::FromStr`]; an
//! unrecognised value is a storage error, never silently mapped.
//!
//! ## Funding lifecycle
//!
//! ```text
//! Pending ──► InProgress ──► Achieved ──► Accepted
//!    │             │             └──────► Refused
//!    └─────────────┴──► Expired
//! ```
//!
//! `Pending → Achieved` is also legal: a single first contribution may fill
//! the whole target.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Declares a text-backed status enum with `as_str`, `FromStr` and `Display`.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// Storage / wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// A stored status string that does not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

text_enum! {
    pub enum MemberRole {
        User => "USER",
        Seller => "SELLER",
    }
}

text_enum! {
    pub enum MemberStatus {
        Active => "ACTIVE",
        Suspended => "SUSPENDED",
        Withdrawn => "WITHDRAWN",
    }
}

text_enum! {
    pub enum ProductStatus {
        OnSale => "ON_SALE",
        SoldOut => "SOLD_OUT",
        Discontinued => "DISCONTINUED",
    }
}

text_enum! {
    /// Projection of the funding state onto the wish item.
    pub enum WishItemStatus {
        Available => "AVAILABLE",
        InFunding => "IN_FUNDING",
        Funded => "FUNDED",
    }
}

text_enum! {
    pub enum FundingStatus {
        /// Materialized by a checkout; no contribution paid yet.
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        /// Target reached; waiting for the recipient.
        Achieved => "ACHIEVED",
        Accepted => "ACCEPTED",
        Refused => "REFUSED",
        Expired => "EXPIRED",
    }
}

text_enum! {
    pub enum CartTargetType {
        /// Points at an existing funding.
        Funding => "FUNDING",
        /// Points at a wish item; the funding is created at checkout.
        FundingPending => "FUNDING_PENDING",
    }
}

text_enum! {
    /// Derived on read from the referenced funding and product.
    pub enum CartItemStatus {
        Available => "AVAILABLE",
        FundingEnded => "FUNDING_ENDED",
        SoldOut => "SOLD_OUT",
        Discontinued => "DISCONTINUED",
    }
}

text_enum! {
    pub enum OrderStatus {
        Created => "CREATED",
        Paid => "PAID",
        Confirmed => "CONFIRMED",
        PartialConfirmed => "PARTIAL_CONFIRMED",
        Canceling => "CANCELING",
        Canceled => "CANCELED",
        PartialCanceling => "PARTIAL_CANCELING",
        PartialCanceled => "PARTIAL_CANCELED",
    }
}

text_enum! {
    pub enum OrderItemType {
        NormalOrder => "NORMAL_ORDER",
        FundingGift => "FUNDING_GIFT",
        NormalGift => "NORMAL_GIFT",
    }
}

text_enum! {
    pub enum OrderItemStatus {
        Created => "CREATED",
        Paid => "PAID",
        Canceling => "CANCELING",
        Canceled => "CANCELED",
        Confirmed => "CONFIRMED",
    }
}

text_enum! {
    pub enum PaymentType {
        Funding => "FUNDING",
        PointCharge => "POINT_CHARGE",
    }
}

text_enum! {
    pub enum PaymentMethod {
        Wallet => "WALLET",
        /// External card gateway with redirect + confirm callback.
        Card => "CARD",
    }
}

text_enum! {
    pub enum PaymentStatus {
        Pending => "PENDING",
        Paid => "PAID",
        Failed => "FAILED",
        Canceled => "CANCELED",
        Refunded => "REFUNDED",
        Received => "RECEIVED",
    }
}

text_enum! {
    pub enum TransactionType {
        Charge => "CHARGE",
        Payment => "PAYMENT",
        Refund => "REFUND",
        Withdraw => "WITHDRAW",
    }
}

// ─────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Funding {
    pub id: i64,
    pub wish_item_id: i64,
    /// Member whose checkout materialized the funding.
    pub organizer_id: i64,
    /// Owner of the wishlist; the only member who may accept or refuse.
    pub recipient_id: i64,
    /// Copied from the product price at creation.
    pub target_amount: i64,
    pub current_amount: i64,
    pub participant_count: i64,
    pub status: FundingStatus,
    pub expires_at: i64,
    pub created_at: i64,
    pub achieved_at: Option<i64>,
    pub decided_at: Option<i64>,
    pub refuse_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingParticipant {
    pub funding_id: i64,
    pub member_id: i64,
    /// Cumulative across all of this member's contributions.
    pub amount: i64,
    pub is_organizer: bool,
    pub participated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub id: i64,
    pub member_id: i64,
    pub target_type: CartTargetType,
    pub funding_id: Option<i64>,
    pub wish_item_id: Option<i64>,
    pub amount: i64,
    pub selected: bool,
    pub status: CartItemStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Selection totals shown next to the cart; unavailable items never count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSummary {
    pub selected_count: usize,
    pub selected_total: i64,
}

impl CartSummary {
    pub fn of(items: &[CartItem]) -> Self {
        items
            .iter()
            .filter(|i| i.selected && i.status == CartItemStatus::Available)
            .fold(Self::default(), |acc, i| Self {
                selected_count: acc.selected_count + 1,
                selected_total: acc.selected_total + i.amount,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub member_id: i64,
    /// Number of line items.
    pub quantity: i64,
    pub total_amount: i64,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub created_at: i64,
    pub paid_at: Option<i64>,
    pub confirmed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub order_item_type: OrderItemType,
    pub seller_id: i64,
    pub receiver_id: i64,
    pub funding_id: Option<i64>,
    pub product_id: i64,
    pub price: i64,
    pub amount: i64,
    pub status: OrderItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub member_id: i64,
    pub balance: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    pub id: i64,
    pub member_id: i64,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Signed: credits positive, debits negative.
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub related_id: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub member_id: i64,
    pub order_id: Option<i64>,
    /// Order identifier handed to the external gateway.
    pub gateway_order_id: Option<String>,
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    pub method: PaymentMethod,
    pub origin_amount: i64,
    pub paid_amount: i64,
    pub status: PaymentStatus,
    pub payment_key: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: i64,
    pub paid_at: Option<i64>,
}
