//! Payment confirmer.
//!
//! Two settlement paths:
//!
//! * **Wallet**: [`pay_with_wallet`] debits the wallet and applies every
//!   contribution of the order inside the caller's transaction.
//! * **Card charge**: [`create_charge`] opens a PENDING top-up, the payer
//!   goes through the gateway's own checkout, and [`confirm_charge`]
//!   finalizes it. The gateway call happens outside any database
//!   transaction; the outcome is then written in a fresh one.

use giftfund_core::notify::EventKind;
use giftfund_core::{
    ledger, DomainError, FundingParticipant, OrderItemType, OrderStatus, Payment, PaymentMethod,
    PaymentStatus, PaymentType, TransactionType,
};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Rules;
use crate::errors::Result;
use crate::events::{self, NewEvent};
use crate::gateway::{ConfirmRequest, PaymentGateway};
use crate::models::{PaymentRow, PAYMENT_COLUMNS};
use crate::{catalog, db, funding, orders, wallet};

/// Callback parameters the payer brings back from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeConfirmation {
    pub payment_id: i64,
    pub payment_key: String,
    pub order_id: String,
    pub amount: i64,
}

struct NewPayment<'a> {
    member_id: i64,
    order_id: Option<i64>,
    gateway_order_id: Option<&'a str>,
    payment_type: PaymentType,
    method: PaymentMethod,
    origin_amount: i64,
    paid_amount: i64,
    status: PaymentStatus,
    paid_at: Option<i64>,
}

async fn insert(conn: &mut SqliteConnection, new: NewPayment<'_>, now: i64) -> Result<Payment> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "INSERT INTO payments
            (member_id, order_id, gateway_order_id, payment_type, method, origin_amount,
             paid_amount, status, created_at, paid_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         RETURNING {PAYMENT_COLUMNS}"
    ))
    .bind(new.member_id)
    .bind(new.order_id)
    .bind(new.gateway_order_id)
    .bind(new.payment_type.as_str())
    .bind(new.method.as_str())
    .bind(new.origin_amount)
    .bind(new.paid_amount)
    .bind(new.status.as_str())
    .bind(now)
    .bind(new.paid_at)
    .fetch_one(&mut *conn)
    .await?;
    row.try_into()
}

/// The member's payment. Payments of other members are not found.
pub async fn load(conn: &mut SqliteConnection, member_id: i64, payment_id: i64) -> Result<Payment> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1 AND member_id = ?2"
    ))
    .bind(payment_id)
    .bind(member_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DomainError::PaymentNotFound(payment_id))?;
    row.try_into()
}

/// Pay a CREATED order from the wallet and capture its contributions.
///
/// On any failure the caller drops the transaction, so the order stays
/// CREATED and the wallet is untouched.
pub async fn pay_with_wallet(
    conn: &mut SqliteConnection,
    member_id: i64,
    order_id: i64,
    rules: &Rules,
    now: i64,
) -> Result<Payment> {
    catalog::require_active(conn, member_id).await?;
    let order = orders::load(conn, member_id, order_id).await?;
    order.status.transition(OrderStatus::Paid)?;

    wallet::debit(
        conn,
        member_id,
        TransactionType::Payment,
        order.total_amount,
        &format!("Payment for {}", order.order_number),
        Some(order_id),
        now,
    )
    .await?;

    for item in orders::items(conn, order_id).await? {
        if let (OrderItemType::FundingGift, Some(funding_id)) = (item.order_item_type, item.funding_id) {
            funding::apply_contribution(conn, funding_id, member_id, item.amount, rules, now).await?;
        }
    }

    orders::transition(conn, &order, OrderStatus::Paid, now).await?;
    let payment = insert(
        conn,
        NewPayment {
            member_id,
            order_id: Some(order_id),
            gateway_order_id: None,
            payment_type: PaymentType::Funding,
            method: PaymentMethod::Wallet,
            origin_amount: order.total_amount,
            paid_amount: order.total_amount,
            status: PaymentStatus::Paid,
            paid_at: Some(now),
        },
        now,
    )
    .await?;

    events::record(
        conn,
        NewEvent::new(EventKind::OrderPaid, order_id)
            .by(member_id)
            .amount(order.total_amount),
        now,
    )
    .await?;
    info!(
        "Order {order_id} paid from wallet of member {member_id} ({})",
        order.total_amount
    );
    Ok(payment)
}

/// Contribute straight from the wallet, without a cart or order.
pub async fn participate(
    conn: &mut SqliteConnection,
    member_id: i64,
    funding_id: i64,
    amount: i64,
    rules: &Rules,
    now: i64,
) -> Result<FundingParticipant> {
    catalog::require_active(conn, member_id).await?;
    // Report rule violations before touching the wallet.
    funding::load(conn, funding_id)
        .await?
        .check_contribution(amount, rules.min_contribution, now)?;

    wallet::debit(
        conn,
        member_id,
        TransactionType::Payment,
        amount,
        &format!("Contribution to funding {funding_id}"),
        Some(funding_id),
        now,
    )
    .await?;
    let participant =
        funding::apply_contribution(conn, funding_id, member_id, amount, rules, now).await?;

    insert(
        conn,
        NewPayment {
            member_id,
            order_id: None,
            gateway_order_id: None,
            payment_type: PaymentType::Funding,
            method: PaymentMethod::Wallet,
            origin_amount: amount,
            paid_amount: amount,
            status: PaymentStatus::Paid,
            paid_at: Some(now),
        },
        now,
    )
    .await?;
    Ok(participant)
}

/// Open a PENDING card top-up.
pub async fn create_charge(
    conn: &mut SqliteConnection,
    member_id: i64,
    amount: i64,
    now: i64,
) -> Result<Payment> {
    catalog::require_active(conn, member_id).await?;
    ledger::check_magnitude(amount)?;

    let gateway_order_id = format!("CHG-{}", Uuid::new_v4().simple());
    let payment = insert(
        conn,
        NewPayment {
            member_id,
            order_id: None,
            gateway_order_id: Some(&gateway_order_id),
            payment_type: PaymentType::PointCharge,
            method: PaymentMethod::Card,
            origin_amount: amount,
            paid_amount: 0,
            status: PaymentStatus::Pending,
            paid_at: None,
        },
        now,
    )
    .await?;

    info!(
        "Charge {} opened for member {member_id}: {amount} ({gateway_order_id})",
        payment.id
    );
    Ok(payment)
}

async fn mark_failed(
    conn: &mut SqliteConnection,
    payment_id: i64,
    code: &str,
    message: &str,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE payments
        SET    status = ?1, failure_code = ?2, failure_message = ?3
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(PaymentStatus::Failed.as_str())
    .bind(code)
    .bind(message)
    .bind(payment_id)
    .bind(PaymentStatus::Pending.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Fail a charge and commit that outcome on its own.
async fn fail_committed(
    pool: &SqlitePool,
    payment: &Payment,
    code: &str,
    message: &str,
    now: i64,
) -> Result<()> {
    let mut tx = db::begin_write(pool).await?;
    if mark_failed(&mut tx, payment.id, code, message).await? {
        events::record(
            &mut tx,
            NewEvent::new(EventKind::ChargeFailed, payment.id)
                .by(payment.member_id)
                .amount(payment.origin_amount),
            now,
        )
        .await?;
    }
    tx.commit().await?;
    warn!("Charge {} failed: {code} {message}", payment.id);
    Ok(())
}

fn require_pending(payment: &Payment) -> Result<()> {
    if payment.status != PaymentStatus::Pending {
        return Err(DomainError::Conflict(format!(
            "payment {} is {}, not PENDING",
            payment.id, payment.status
        ))
        .into());
    }
    Ok(())
}

/// Finalize a card top-up after the gateway redirect.
pub async fn confirm_charge(
    pool: &SqlitePool,
    gateway: &dyn PaymentGateway,
    member_id: i64,
    confirmation: &ChargeConfirmation,
    now: i64,
) -> Result<Payment> {
    let payment = {
        let mut conn = pool.acquire().await?;
        load(&mut conn, member_id, confirmation.payment_id).await?
    };
    require_pending(&payment)?;
    if payment.payment_type != PaymentType::PointCharge {
        return Err(DomainError::Validation(format!(
            "payment {} is not a card charge",
            payment.id
        ))
        .into());
    }
    if payment.gateway_order_id.as_deref() != Some(confirmation.order_id.as_str()) {
        return Err(DomainError::Validation(format!(
            "orderId {} does not belong to payment {}",
            confirmation.order_id, payment.id
        ))
        .into());
    }

    if confirmation.amount != payment.origin_amount {
        let err = DomainError::AmountMismatch {
            expected: payment.origin_amount,
            actual: confirmation.amount,
        };
        fail_committed(pool, &payment, err.code().as_str(), &err.to_string(), now).await?;
        return Err(err.into());
    }

    let request = ConfirmRequest {
        payment_key: confirmation.payment_key.clone(),
        order_id: confirmation.order_id.clone(),
        amount: confirmation.amount,
    };
    let receipt = match gateway.confirm(&request).await {
        Ok(receipt) => receipt,
        Err(e) => {
            let message = e.user_message();
            fail_committed(pool, &payment, e.code(), &message, now).await?;
            return Err(DomainError::ChargeFailed {
                code: e.code().to_string(),
                message,
            }
            .into());
        }
    };
    if receipt.total_amount != payment.origin_amount {
        let err = DomainError::AmountMismatch {
            expected: payment.origin_amount,
            actual: receipt.total_amount,
        };
        fail_committed(pool, &payment, err.code().as_str(), &err.to_string(), now).await?;
        return Err(err.into());
    }

    let mut tx = db::begin_write(pool).await?;
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        "UPDATE payments
         SET    status = ?1, payment_key = ?2, paid_amount = ?3, paid_at = ?4
         WHERE  id = ?5 AND status = ?6
         RETURNING {PAYMENT_COLUMNS}"
    ))
    .bind(PaymentStatus::Paid.as_str())
    .bind(&receipt.payment_key)
    .bind(receipt.total_amount)
    .bind(now)
    .bind(payment.id)
    .bind(PaymentStatus::Pending.as_str())
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| {
        DomainError::Conflict(format!("payment {} was settled concurrently", payment.id))
    })?;

    wallet::credit(
        &mut tx,
        member_id,
        TransactionType::Charge,
        receipt.total_amount,
        "Card charge",
        Some(payment.id),
        now,
    )
    .await?;
    events::record(
        &mut tx,
        NewEvent::new(EventKind::WalletCharged, member_id)
            .by(member_id)
            .amount(receipt.total_amount),
        now,
    )
    .await?;
    tx.commit().await?;

    info!(
        "Charge {} confirmed: wallet of member {member_id} credited {}",
        payment.id, receipt.total_amount
    );
    row.try_into()
}

/// The payer came back from the gateway with a failure instead of a key.
pub async fn fail_charge(
    conn: &mut SqliteConnection,
    member_id: i64,
    payment_id: i64,
    code: &str,
    message: &str,
    now: i64,
) -> Result<Payment> {
    let payment = load(conn, member_id, payment_id).await?;
    require_pending(&payment)?;
    if mark_failed(conn, payment_id, code, message).await? {
        events::record(
            conn,
            NewEvent::new(EventKind::ChargeFailed, payment_id)
                .by(member_id)
                .amount(payment.origin_amount),
            now,
        )
        .await?;
    }
    warn!("Charge {payment_id} reported failed by the payer: {code}");
    load(conn, member_id, payment_id).await
}
