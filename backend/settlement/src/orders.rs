//! Order assembler.
//!
//! Turns a set of cart items into one order with one `FUNDING_GIFT` line per
//! item. Validation covers the whole set before anything is written, and the
//! caller's transaction spans assembly (and wallet payment, when requested),
//! so a request either produces a complete order or leaves no trace.

use std::collections::HashMap;

use giftfund_core::funding::NewFunding;
use giftfund_core::notify::EventKind;
use giftfund_core::order::cart_fingerprint;
use giftfund_core::{
    CartItem, CartItemStatus, CartTargetType, DomainError, Funding, FundingStatus, Order,
    OrderItem, OrderItemStatus, OrderItemType, OrderStatus, PaymentMethod, PaymentStatus,
    TransactionType,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::catalog::{self, WishTarget};
use crate::config::Rules;
use crate::db::{self, Page};
use crate::errors::{AppError, Result};
use crate::events::{self, NewEvent};
use crate::models::{OrderItemRow, OrderRow, ORDER_COLUMNS, ORDER_ITEM_COLUMNS};
use crate::{cart, funding, payments, wallet};

/// A checkout request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub cart_item_ids: Vec<i64>,
    pub payment_method: PaymentMethod,
    /// Leave the order CREATED and pay it later with `POST /orders/{id}/pay`.
    pub defer_payment: bool,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// Which funding a line contributes to before anything is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FundingKey {
    Existing(i64),
    /// No funding yet; one is created for this wish item at checkout.
    Pending(i64),
}

struct Line {
    cart_item_id: i64,
    key: FundingKey,
    target: WishTarget,
    amount: i64,
}

fn reject_line(cart_item_id: i64, err: AppError) -> AppError {
    match err {
        AppError::Domain(inner) => DomainError::InvalidCartLine {
            cart_item_id,
            source: Box::new(inner),
        }
        .into(),
        other => other,
    }
}

/// Stand-in for a funding that will be created at checkout.
fn virtual_funding(target: &WishTarget, rules: &Rules, now: i64) -> Funding {
    Funding {
        id: 0,
        wish_item_id: target.wish_item_id,
        organizer_id: 0,
        recipient_id: target.owner_id,
        target_amount: target.price,
        current_amount: 0,
        participant_count: 0,
        status: FundingStatus::Pending,
        expires_at: now + rules.funding_duration_days * giftfund_core::funding::SECONDS_PER_DAY,
        created_at: now,
        achieved_at: None,
        decided_at: None,
        refuse_reason: None,
    }
}

/// Resolve one cart item and check it against the running state of its
/// funding, which already includes earlier lines of the same order.
async fn plan_line(
    conn: &mut SqliteConnection,
    item: &CartItem,
    projected: &mut HashMap<FundingKey, Funding>,
    rules: &Rules,
    now: i64,
) -> Result<Line> {
    if item.status != CartItemStatus::Available {
        return Err(DomainError::Validation(format!("target is {}", item.status)).into());
    }

    let key = match (item.target_type, item.funding_id, item.wish_item_id) {
        (CartTargetType::Funding, Some(id), _) => FundingKey::Existing(id),
        (CartTargetType::FundingPending, _, Some(wish)) => {
            match funding::active_for_wish_item(conn, wish).await? {
                Some(active) => FundingKey::Existing(active.id),
                None => FundingKey::Pending(wish),
            }
        }
        _ => return Err(DomainError::Validation("cart item has no target".to_string()).into()),
    };

    let mut state = match projected.remove(&key) {
        Some(state) => state,
        None => match key {
            FundingKey::Existing(id) => funding::load(conn, id).await?,
            FundingKey::Pending(wish) => {
                let target = catalog::load_wish_target(conn, wish).await?;
                virtual_funding(&target, rules, now)
            }
        },
    };

    let target = catalog::load_wish_target(conn, state.wish_item_id).await?;
    if target.product_status()? != giftfund_core::ProductStatus::OnSale {
        return Err(DomainError::Validation(format!(
            "product {} is {}",
            target.product_id, target.product_status
        ))
        .into());
    }

    state.check_contribution(item.amount, rules.min_contribution, now)?;
    state.current_amount += item.amount;
    projected.insert(key, state);

    Ok(Line {
        cart_item_id: item.id,
        key,
        target,
        amount: item.amount,
    })
}

async fn find_idempotent(
    conn: &mut SqliteConnection,
    member_id: i64,
    key: &str,
) -> Result<Option<(String, i64)>> {
    let row: Option<(String, i64)> = sqlx::query_as(
        "SELECT fingerprint, order_id FROM order_idempotency WHERE member_id = ?1 AND idempotency_key = ?2",
    )
    .bind(member_id)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Assemble an order from cart items and, unless deferred, pay it from the
/// wallet in the same transaction.
pub async fn create_order(
    conn: &mut SqliteConnection,
    member_id: i64,
    request: &NewOrder,
    rules: &Rules,
    now: i64,
) -> Result<OrderDetail> {
    catalog::require_active(conn, member_id).await?;
    let fingerprint = cart_fingerprint(&request.cart_item_ids)?;

    if let Some(key) = &request.idempotency_key {
        if let Some((stored, order_id)) = find_idempotent(conn, member_id, key).await? {
            if stored != fingerprint {
                warn!("Idempotency key {key:?} of member {member_id} reused for another cart");
                return Err(DomainError::Conflict(format!(
                    "idempotency key {key:?} was used for a different cart"
                ))
                .into());
            }
            info!("Replaying order {order_id} for idempotency key {key:?}");
            return detail(conn, member_id, order_id).await;
        }
    }

    if request.payment_method != PaymentMethod::Wallet {
        return Err(DomainError::Validation(format!(
            "orders can only be paid with {}",
            PaymentMethod::Wallet
        ))
        .into());
    }

    let items = cart::load_owned(conn, member_id, &request.cart_item_ids, now).await?;
    let mut projected = HashMap::new();
    let mut lines = Vec::with_capacity(items.len());
    for item in &items {
        let line = plan_line(conn, item, &mut projected, rules, now)
            .await
            .map_err(|e| reject_line(item.id, e))?;
        lines.push(line);
    }

    // Materialize campaigns for wish items that had none.
    let mut materialized: HashMap<FundingKey, Funding> = HashMap::new();
    for line in &lines {
        if materialized.contains_key(&line.key) {
            continue;
        }
        let real = match line.key {
            FundingKey::Existing(id) => funding::load(conn, id).await?,
            FundingKey::Pending(wish) => {
                let new = NewFunding {
                    wish_item_id: wish,
                    organizer_id: member_id,
                    recipient_id: line.target.owner_id,
                    target_amount: line.target.price,
                    expires_in_days: rules.funding_duration_days,
                };
                funding::create_funding(conn, &new, now).await?
            }
        };
        materialized.insert(line.key, real);
    }

    let total: i64 = lines.iter().map(|l| l.amount).sum();
    let order_id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO orders (member_id, quantity, total_amount, payment_method, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING id
        "#,
    )
    .bind(member_id)
    .bind(lines.len() as i64)
    .bind(total)
    .bind(request.payment_method.as_str())
    .bind(OrderStatus::Created.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE orders SET order_number = ?1 WHERE id = ?2")
        .bind(db::order_number(order_id, now))
        .bind(order_id)
        .execute(&mut *conn)
        .await?;

    for line in &lines {
        let f = &materialized[&line.key];
        sqlx::query(
            r#"
            INSERT INTO order_items
                (order_id, order_item_type, seller_id, receiver_id, funding_id, product_id, price, amount, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(order_id)
        .bind(OrderItemType::FundingGift.as_str())
        .bind(line.target.seller_id)
        .bind(f.recipient_id)
        .bind(f.id)
        .bind(line.target.product_id)
        .bind(line.target.price)
        .bind(line.amount)
        .bind(OrderItemStatus::Created.as_str())
        .execute(&mut *conn)
        .await?;
    }

    let consumed: Vec<i64> = lines.iter().map(|l| l.cart_item_id).collect();
    cart::consume(conn, member_id, &consumed).await?;

    if let Some(key) = &request.idempotency_key {
        sqlx::query(
            r#"
            INSERT INTO order_idempotency (member_id, idempotency_key, fingerprint, order_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(member_id)
        .bind(key)
        .bind(&fingerprint)
        .bind(order_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    events::record(
        conn,
        NewEvent::new(EventKind::OrderCreated, order_id)
            .by(member_id)
            .amount(total),
        now,
    )
    .await?;
    info!(
        "Order {order_id} created for member {member_id}: {} lines, total {total}",
        lines.len()
    );

    if request.payment_method == PaymentMethod::Wallet && !request.defer_payment {
        payments::pay_with_wallet(conn, member_id, order_id, rules, now).await?;
    }

    detail(conn, member_id, order_id).await
}

/// The member's order. Orders of other members are not found.
pub async fn load(conn: &mut SqliteConnection, member_id: i64, order_id: i64) -> Result<Order> {
    let row = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1 AND member_id = ?2"
    ))
    .bind(order_id)
    .bind(member_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DomainError::OrderNotFound(order_id))?;
    row.try_into()
}

pub async fn items(conn: &mut SqliteConnection, order_id: i64) -> Result<Vec<OrderItem>> {
    let rows = sqlx::query_as::<_, OrderItemRow>(&format!(
        "SELECT {ORDER_ITEM_COLUMNS} FROM order_items WHERE order_id = ?1 ORDER BY id ASC"
    ))
    .bind(order_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(OrderItem::try_from).collect()
}

pub async fn detail(conn: &mut SqliteConnection, member_id: i64, order_id: i64) -> Result<OrderDetail> {
    let order = load(conn, member_id, order_id).await?;
    let items = items(conn, order_id).await?;
    Ok(OrderDetail { order, items })
}

/// Newest first.
pub async fn list(conn: &mut SqliteConnection, member_id: i64, page: Page) -> Result<Vec<Order>> {
    let rows = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders WHERE member_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
    ))
    .bind(member_id)
    .bind(page.size)
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Order::try_from).collect()
}

/// Move an order (and its items) to `next`, guarded by the status that was read.
pub(crate) async fn transition(
    conn: &mut SqliteConnection,
    order: &Order,
    next: OrderStatus,
    now: i64,
) -> Result<Order> {
    order.status.transition(next)?;

    let stamp = match next {
        OrderStatus::Paid => Some("paid_at"),
        OrderStatus::Confirmed | OrderStatus::PartialConfirmed => Some("confirmed_at"),
        OrderStatus::Canceled | OrderStatus::PartialCanceled => Some("cancelled_at"),
        _ => None,
    };
    let set = match stamp {
        Some(column) => format!("status = ?1, {column} = ?4"),
        None => "status = ?1".to_string(),
    };
    let sql = format!(
        "UPDATE orders SET {set} WHERE id = ?2 AND status = ?3 RETURNING {ORDER_COLUMNS}"
    );

    let mut query = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(next.as_str())
        .bind(order.id)
        .bind(order.status.as_str());
    if stamp.is_some() {
        query = query.bind(now);
    }
    let row = query
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DomainError::Conflict(format!("order {} changed concurrently", order.id)))?;

    sqlx::query("UPDATE order_items SET status = ?1 WHERE order_id = ?2")
        .bind(OrderItemStatus::mirror(next).as_str())
        .bind(order.id)
        .execute(&mut *conn)
        .await?;

    info!("Order {} moved {} -> {next}", order.id, order.status);
    row.try_into()
}

/// Buyer confirms a paid order.
pub async fn confirm(
    conn: &mut SqliteConnection,
    member_id: i64,
    order_id: i64,
    now: i64,
) -> Result<OrderDetail> {
    let order = load(conn, member_id, order_id).await?;
    transition(conn, &order, OrderStatus::Confirmed, now).await?;
    events::record(
        conn,
        NewEvent::new(EventKind::OrderConfirmed, order_id).by(member_id),
        now,
    )
    .await?;
    detail(conn, member_id, order_id).await
}

/// Cancel an order that was never paid. Nothing moved, so nothing is
/// refunded; fundings its checkout opened are released when no other unpaid
/// line still needs them.
async fn cancel_unpaid(conn: &mut SqliteConnection, order: &Order, now: i64) -> Result<()> {
    transition(conn, order, OrderStatus::Canceled, now).await?;

    let mut released = Vec::new();
    for item in items(conn, order.id).await? {
        let Some(funding_id) = item.funding_id else {
            continue;
        };
        if released.contains(&funding_id) {
            continue;
        }
        funding::release_if_abandoned(conn, funding_id, now).await?;
        released.push(funding_id);
    }

    events::record(
        conn,
        NewEvent::new(EventKind::OrderCanceled, order.id)
            .by(order.member_id)
            .amount(0),
        now,
    )
    .await?;
    Ok(())
}

/// Cancel every unpaid order with a line on `funding_id`, which can no
/// longer take contributions. Returns the canceled order ids.
pub async fn cancel_unpayable(
    conn: &mut SqliteConnection,
    funding_id: i64,
    now: i64,
) -> Result<Vec<i64>> {
    let rows = sqlx::query_as::<_, OrderRow>(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE  status = ?1
           AND  id IN (SELECT order_id FROM order_items WHERE funding_id = ?2)
         ORDER  BY id"
    ))
    .bind(OrderStatus::Created.as_str())
    .bind(funding_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut canceled = Vec::with_capacity(rows.len());
    for row in rows {
        let order = Order::try_from(row)?;
        cancel_unpaid(conn, &order, now).await?;
        canceled.push(order.id);
    }
    Ok(canceled)
}

/// Cancel an order. A paid order has every contribution reversed and the
/// wallet debit refunded; an unpaid one is simply closed.
pub async fn cancel(
    conn: &mut SqliteConnection,
    member_id: i64,
    order_id: i64,
    now: i64,
) -> Result<OrderDetail> {
    let order = load(conn, member_id, order_id).await?;
    if order.status == OrderStatus::Created {
        cancel_unpaid(conn, &order, now).await?;
        info!("Unpaid order {order_id} canceled by member {member_id}");
        return detail(conn, member_id, order_id).await;
    }
    let canceling = transition(conn, &order, OrderStatus::Canceling, now).await?;

    for item in items(conn, order_id).await? {
        let Some(funding_id) = item.funding_id else {
            continue;
        };
        if item.order_item_type != OrderItemType::FundingGift {
            continue;
        }
        let f = funding::load(conn, funding_id).await?;
        if f.status == FundingStatus::Accepted {
            return Err(DomainError::Conflict(format!(
                "funding {funding_id} was already accepted by its recipient"
            ))
            .into());
        }
        funding::reverse_contribution(conn, funding_id, member_id, item.amount).await?;
    }

    wallet::credit(
        conn,
        member_id,
        TransactionType::Refund,
        order.total_amount,
        &format!("Refund for {}", order.order_number),
        Some(order_id),
        now,
    )
    .await?;
    sqlx::query("UPDATE payments SET status = ?1 WHERE order_id = ?2 AND status = ?3")
        .bind(PaymentStatus::Refunded.as_str())
        .bind(order_id)
        .bind(PaymentStatus::Paid.as_str())
        .execute(&mut *conn)
        .await?;

    transition(conn, &canceling, OrderStatus::Canceled, now).await?;
    events::record(
        conn,
        NewEvent::new(EventKind::OrderCanceled, order_id)
            .by(member_id)
            .amount(order.total_amount),
        now,
    )
    .await?;

    detail(conn, member_id, order_id).await
}
