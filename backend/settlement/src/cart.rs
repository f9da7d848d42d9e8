//! Cart staging area.
//!
//! A cart item is an unpaid contribution intent. It points either at an
//! existing funding (`FUNDING`) or at a wish item whose funding will be
//! materialized at checkout (`FUNDING_PENDING`). Nothing here touches funding
//! state; the item status is derived on every read from what it points at.

use giftfund_core::{
    CartItem, CartItemStatus, CartSummary, CartTargetType, DomainError, FundingStatus,
    ProductStatus, WishItemStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::info;

use crate::catalog;
use crate::config::Rules;
use crate::errors::Result;
use crate::funding;
use crate::models::CartRow;

const CART_SELECT: &str = r#"
    SELECT c.id, c.member_id, c.target_type, c.funding_id, c.wish_item_id, c.amount,
           c.selected, c.created_at, c.updated_at,
           f.status AS funding_status, f.expires_at AS funding_expires_at,
           w.status AS wish_item_status, p.status AS product_status
    FROM   cart_items c
    LEFT   JOIN fundings   f ON f.id = c.funding_id
    LEFT   JOIN wish_items w ON w.id = COALESCE(c.wish_item_id, f.wish_item_id)
    LEFT   JOIN products   p ON p.id = w.product_id
"#;

/// What a new cart item contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartTarget {
    Funding(i64),
    WishItem(i64),
}

impl CartTarget {
    /// Exactly one of the two ids must be present.
    pub fn from_ids(funding_id: Option<i64>, wish_item_id: Option<i64>) -> Result<Self> {
        match (funding_id, wish_item_id) {
            (Some(id), None) => Ok(Self::Funding(id)),
            (None, Some(id)) => Ok(Self::WishItem(id)),
            _ => Err(DomainError::Validation(
                "exactly one of fundingId or wishItemId is required".to_string(),
            )
            .into()),
        }
    }
}

/// Partial update of a cart item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartPatch {
    pub amount: Option<i64>,
    pub selected: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartItem>,
    pub summary: CartSummary,
}

/// Availability of a staged contribution right now.
pub fn derive_status(row: &CartRow, now: i64) -> Result<CartItemStatus> {
    if let Some(product) = &row.product_status {
        match product.parse::<ProductStatus>()? {
            ProductStatus::SoldOut => return Ok(CartItemStatus::SoldOut),
            ProductStatus::Discontinued => return Ok(CartItemStatus::Discontinued),
            ProductStatus::OnSale => {}
        }
    }

    let ended = match row.target_type.parse::<CartTargetType>()? {
        CartTargetType::Funding => match (&row.funding_status, row.funding_expires_at) {
            (Some(status), Some(expires_at)) => {
                !status.parse::<FundingStatus>()?.is_contributable() || now > expires_at
            }
            _ => true,
        },
        CartTargetType::FundingPending => match &row.wish_item_status {
            Some(status) => status.parse::<WishItemStatus>()? == WishItemStatus::Funded,
            None => true,
        },
    };
    Ok(if ended {
        CartItemStatus::FundingEnded
    } else {
        CartItemStatus::Available
    })
}

fn check_amount(amount: i64, rules: &Rules) -> Result<()> {
    if amount <= 0 {
        return Err(DomainError::Validation("amount must be positive".to_string()).into());
    }
    if amount < rules.min_contribution {
        return Err(DomainError::BelowMinimum {
            minimum: rules.min_contribution,
        }
        .into());
    }
    Ok(())
}

/// Validate `amount` against whatever the item points at.
async fn check_against_target(
    conn: &mut SqliteConnection,
    target_type: CartTargetType,
    target_id: i64,
    amount: i64,
    rules: &Rules,
    now: i64,
) -> Result<()> {
    check_amount(amount, rules)?;
    match target_type {
        CartTargetType::Funding => {
            let f = funding::load(conn, target_id).await?;
            f.check_contribution(amount, rules.min_contribution, now)?;
        }
        CartTargetType::FundingPending => {
            let target = catalog::load_wish_target(conn, target_id).await?;
            if target.product_status()? != ProductStatus::OnSale {
                return Err(DomainError::Validation(format!(
                    "product {} is {}",
                    target.product_id, target.product_status
                ))
                .into());
            }
            if amount > target.price {
                return Err(DomainError::ExceedTarget {
                    target: target.price,
                }
                .into());
            }
        }
    }
    Ok(())
}

async fn load_row(conn: &mut SqliteConnection, member_id: i64, item_id: i64) -> Result<CartRow> {
    let row = sqlx::query_as::<_, CartRow>(&format!(
        "{CART_SELECT} WHERE c.id = ?1 AND c.member_id = ?2"
    ))
    .bind(item_id)
    .bind(member_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DomainError::CartItemNotFound(item_id))?;
    Ok(row)
}

/// A member's cart item with its current status. Foreign ids are not found.
pub async fn load_item(
    conn: &mut SqliteConnection,
    member_id: i64,
    item_id: i64,
    now: i64,
) -> Result<CartItem> {
    let row = load_row(conn, member_id, item_id).await?;
    let status = derive_status(&row, now)?;
    row.into_item(status)
}

/// Load the named items in request order; any missing or foreign id fails.
pub async fn load_owned(
    conn: &mut SqliteConnection,
    member_id: i64,
    item_ids: &[i64],
    now: i64,
) -> Result<Vec<CartItem>> {
    let mut items = Vec::with_capacity(item_ids.len());
    for &id in item_ids {
        items.push(load_item(conn, member_id, id, now).await?);
    }
    Ok(items)
}

pub async fn add_item(
    conn: &mut SqliteConnection,
    member_id: i64,
    target: CartTarget,
    amount: i64,
    rules: &Rules,
    now: i64,
) -> Result<CartItem> {
    catalog::require_active(conn, member_id).await?;

    // A wish item that already has a live campaign is staged against it.
    let (target_type, target_id) = match target {
        CartTarget::Funding(id) => (CartTargetType::Funding, id),
        CartTarget::WishItem(wish_item_id) => {
            let wish = catalog::load_wish_target(conn, wish_item_id).await?;
            if wish.wish_item_status.parse::<WishItemStatus>()? == WishItemStatus::Funded {
                return Err(DomainError::Conflict(format!(
                    "wish item {wish_item_id} is already funded"
                ))
                .into());
            }
            match funding::active_for_wish_item(conn, wish_item_id).await? {
                Some(active) => (CartTargetType::Funding, active.id),
                None => (CartTargetType::FundingPending, wish_item_id),
            }
        }
    };
    check_against_target(conn, target_type, target_id, amount, rules, now).await?;

    let column = match target_type {
        CartTargetType::Funding => "funding_id",
        CartTargetType::FundingPending => "wish_item_id",
    };
    let existing: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM cart_items WHERE member_id = ?1 AND {column} = ?2"
    ))
    .bind(member_id)
    .bind(target_id)
    .fetch_optional(&mut *conn)
    .await?;

    let id = match existing {
        Some(id) => {
            sqlx::query(
                "UPDATE cart_items SET amount = ?1, selected = 1, updated_at = ?2 WHERE id = ?3",
            )
            .bind(amount)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            info!("Cart item {id} of member {member_id} merged to amount {amount}");
            id
        }
        None => {
            let id = sqlx::query_scalar::<_, i64>(&format!(
                "INSERT INTO cart_items (member_id, target_type, {column}, amount, selected, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
                 RETURNING id"
            ))
            .bind(member_id)
            .bind(target_type.as_str())
            .bind(target_id)
            .bind(amount)
            .bind(now)
            .fetch_one(&mut *conn)
            .await?;
            info!("Member {member_id} staged {amount} for {target_type} {target_id} (cart item {id})");
            id
        }
    };

    load_item(conn, member_id, id, now).await
}

pub async fn update_item(
    conn: &mut SqliteConnection,
    member_id: i64,
    item_id: i64,
    patch: CartPatch,
    rules: &Rules,
    now: i64,
) -> Result<CartItem> {
    let current = load_item(conn, member_id, item_id, now).await?;

    if let Some(amount) = patch.amount {
        let target_id = match current.target_type {
            CartTargetType::Funding => current.funding_id,
            CartTargetType::FundingPending => current.wish_item_id,
        }
        .ok_or_else(|| DomainError::Validation(format!("cart item {item_id} has no target")))?;
        check_against_target(conn, current.target_type, target_id, amount, rules, now).await?;
    }

    sqlx::query("UPDATE cart_items SET amount = ?1, selected = ?2, updated_at = ?3 WHERE id = ?4")
        .bind(patch.amount.unwrap_or(current.amount))
        .bind(patch.selected.unwrap_or(current.selected))
        .bind(now)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;

    load_item(conn, member_id, item_id, now).await
}

pub async fn remove_item(conn: &mut SqliteConnection, member_id: i64, item_id: i64) -> Result<()> {
    let removed = sqlx::query("DELETE FROM cart_items WHERE id = ?1 AND member_id = ?2")
        .bind(item_id)
        .bind(member_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if removed == 0 {
        return Err(DomainError::CartItemNotFound(item_id).into());
    }
    Ok(())
}

/// Empty the member's cart; returns how many items were dropped.
pub async fn clear(conn: &mut SqliteConnection, member_id: i64) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM cart_items WHERE member_id = ?1")
        .bind(member_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(removed)
}

/// Drop items consumed by a checkout.
pub async fn consume(conn: &mut SqliteConnection, member_id: i64, item_ids: &[i64]) -> Result<()> {
    for &id in item_ids {
        remove_item(conn, member_id, id).await?;
    }
    Ok(())
}

pub async fn list_items(conn: &mut SqliteConnection, member_id: i64, now: i64) -> Result<CartView> {
    let rows = sqlx::query_as::<_, CartRow>(&format!(
        "{CART_SELECT} WHERE c.member_id = ?1 ORDER BY c.id ASC"
    ))
    .bind(member_id)
    .fetch_all(&mut *conn)
    .await?;

    let items = rows
        .into_iter()
        .map(|row| {
            let status = derive_status(&row, now)?;
            row.into_item(status)
        })
        .collect::<Result<Vec<_>>>()?;
    let summary = CartSummary::of(&items);
    Ok(CartView { items, summary })
}
