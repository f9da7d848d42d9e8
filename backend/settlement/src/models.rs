//! Row shapes as stored in SQLite, and their conversion into domain types.
//!
//! Status columns are `TEXT`; they are parsed here so the rest of the crate
//! only handles closed enums.

use giftfund_core::types::{
    CartItemStatus, Funding, FundingParticipant, Order, OrderItem, Payment, Wallet,
    WalletTransaction,
};
use giftfund_core::CartItem;

use crate::errors::AppError;

pub const FUNDING_COLUMNS: &str = "id, wish_item_id, organizer_id, recipient_id, target_amount, \
     current_amount, participant_count, status, expires_at, created_at, achieved_at, \
     decided_at, refuse_reason";

pub const ORDER_COLUMNS: &str = "id, order_number, member_id, quantity, total_amount, \
     payment_method, status, created_at, paid_at, confirmed_at, cancelled_at";

pub const ORDER_ITEM_COLUMNS: &str = "id, order_id, order_item_type, seller_id, receiver_id, \
     funding_id, product_id, price, amount, status";

pub const PAYMENT_COLUMNS: &str = "id, member_id, order_id, gateway_order_id, payment_type, \
     method, origin_amount, paid_amount, status, payment_key, failure_code, failure_message, \
     created_at, paid_at";

pub const WALLET_TX_COLUMNS: &str =
    "id, member_id, tx_type, amount, balance_after, description, related_id, created_at";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FundingRow {
    pub id: i64,
    pub wish_item_id: i64,
    pub organizer_id: i64,
    pub recipient_id: i64,
    pub target_amount: i64,
    pub current_amount: i64,
    pub participant_count: i64,
    pub status: String,
    pub expires_at: i64,
    pub created_at: i64,
    pub achieved_at: Option<i64>,
    pub decided_at: Option<i64>,
    pub refuse_reason: Option<String>,
}

impl TryFrom<FundingRow> for Funding {
    type Error = AppError;

    fn try_from(row: FundingRow) -> Result<Self, Self::Error> {
        Ok(Funding {
            id: row.id,
            wish_item_id: row.wish_item_id,
            organizer_id: row.organizer_id,
            recipient_id: row.recipient_id,
            target_amount: row.target_amount,
            current_amount: row.current_amount,
            participant_count: row.participant_count,
            status: row.status.parse()?,
            expires_at: row.expires_at,
            created_at: row.created_at,
            achieved_at: row.achieved_at,
            decided_at: row.decided_at,
            refuse_reason: row.refuse_reason,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ParticipantRow {
    pub funding_id: i64,
    pub member_id: i64,
    pub amount: i64,
    pub is_organizer: bool,
    pub participated_at: i64,
}

impl From<ParticipantRow> for FundingParticipant {
    fn from(row: ParticipantRow) -> Self {
        FundingParticipant {
            funding_id: row.funding_id,
            member_id: row.member_id,
            amount: row.amount,
            is_organizer: row.is_organizer,
            participated_at: row.participated_at,
        }
    }
}

/// A cart row joined with everything its derived status depends on.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CartRow {
    pub id: i64,
    pub member_id: i64,
    pub target_type: String,
    pub funding_id: Option<i64>,
    pub wish_item_id: Option<i64>,
    pub amount: i64,
    pub selected: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub funding_status: Option<String>,
    pub funding_expires_at: Option<i64>,
    pub wish_item_status: Option<String>,
    pub product_status: Option<String>,
}

impl CartRow {
    pub fn into_item(self, status: CartItemStatus) -> Result<CartItem, AppError> {
        Ok(CartItem {
            id: self.id,
            member_id: self.member_id,
            target_type: self.target_type.parse()?,
            funding_id: self.funding_id,
            wish_item_id: self.wish_item_id,
            amount: self.amount,
            selected: self.selected,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    pub id: i64,
    pub order_number: String,
    pub member_id: i64,
    pub quantity: i64,
    pub total_amount: i64,
    pub payment_method: String,
    pub status: String,
    pub created_at: i64,
    pub paid_at: Option<i64>,
    pub confirmed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

impl TryFrom<OrderRow> for Order {
    type Error = AppError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            order_number: row.order_number,
            member_id: row.member_id,
            quantity: row.quantity,
            total_amount: row.total_amount,
            payment_method: row.payment_method.parse()?,
            status: row.status.parse()?,
            created_at: row.created_at,
            paid_at: row.paid_at,
            confirmed_at: row.confirmed_at,
            cancelled_at: row.cancelled_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderItemRow {
    pub id: i64,
    pub order_id: i64,
    pub order_item_type: String,
    pub seller_id: i64,
    pub receiver_id: i64,
    pub funding_id: Option<i64>,
    pub product_id: i64,
    pub price: i64,
    pub amount: i64,
    pub status: String,
}

impl TryFrom<OrderItemRow> for OrderItem {
    type Error = AppError;

    fn try_from(row: OrderItemRow) -> Result<Self, Self::Error> {
        Ok(OrderItem {
            id: row.id,
            order_id: row.order_id,
            order_item_type: row.order_item_type.parse()?,
            seller_id: row.seller_id,
            receiver_id: row.receiver_id,
            funding_id: row.funding_id,
            product_id: row.product_id,
            price: row.price,
            amount: row.amount,
            status: row.status.parse()?,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WalletRow {
    pub member_id: i64,
    pub balance: i64,
    pub updated_at: i64,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            member_id: row.member_id,
            balance: row.balance,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WalletTxRow {
    pub id: i64,
    pub member_id: i64,
    pub tx_type: String,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub related_id: Option<i64>,
    pub created_at: i64,
}

impl TryFrom<WalletTxRow> for WalletTransaction {
    type Error = AppError;

    fn try_from(row: WalletTxRow) -> Result<Self, Self::Error> {
        Ok(WalletTransaction {
            id: row.id,
            member_id: row.member_id,
            tx_type: row.tx_type.parse()?,
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            related_id: row.related_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRow {
    pub id: i64,
    pub member_id: i64,
    pub order_id: Option<i64>,
    pub gateway_order_id: Option<String>,
    pub payment_type: String,
    pub method: String,
    pub origin_amount: i64,
    pub paid_amount: i64,
    pub status: String,
    pub payment_key: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: i64,
    pub paid_at: Option<i64>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = AppError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            member_id: row.member_id,
            order_id: row.order_id,
            gateway_order_id: row.gateway_order_id,
            payment_type: row.payment_type.parse()?,
            method: row.method.parse()?,
            origin_amount: row.origin_amount,
            paid_amount: row.paid_amount,
            status: row.status.parse()?,
            payment_key: row.payment_key,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}
