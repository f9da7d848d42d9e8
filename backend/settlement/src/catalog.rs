//! Members, products and wish items.
//!
//! The catalog and member registry live in other services; this module keeps
//! only the rows the settlement pipeline joins against, plus the helpers that
//! provision them.

use giftfund_core::{
    DomainError, FundingStatus, MemberRole, MemberStatus, ProductStatus, WishItemStatus,
};
use sqlx::SqliteConnection;
use tracing::info;

use crate::errors::Result;

/// A wish item joined with its product and the wishlist owner.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WishTarget {
    pub wish_item_id: i64,
    pub owner_id: i64,
    pub product_id: i64,
    pub seller_id: i64,
    pub price: i64,
    pub product_status: String,
    pub wish_item_status: String,
}

impl WishTarget {
    pub fn product_status(&self) -> Result<ProductStatus> {
        Ok(self.product_status.parse()?)
    }
}

/// Register a member together with their wallet and wishlist.
pub async fn create_member(
    conn: &mut SqliteConnection,
    nickname: &str,
    role: MemberRole,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO members (nickname, role, status, created_at) VALUES (?1, ?2, ?3, ?4) RETURNING id",
    )
    .bind(nickname)
    .bind(role.as_str())
    .bind(MemberStatus::Active.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO wallets (member_id, balance, updated_at) VALUES (?1, 0, ?2)")
        .bind(id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO wishlists (member_id) VALUES (?1)")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    info!("Member {id} registered as {role}");
    Ok(id)
}

pub async fn set_member_status(
    conn: &mut SqliteConnection,
    member_id: i64,
    status: MemberStatus,
) -> Result<()> {
    sqlx::query("UPDATE members SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(member_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Reject members that are not ACTIVE from moving money.
pub async fn require_active(conn: &mut SqliteConnection, member_id: i64) -> Result<()> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM members WHERE id = ?1")
        .bind(member_id)
        .fetch_optional(&mut *conn)
        .await?;
    match status {
        None => Err(DomainError::AuthRequired.into()),
        Some(s) if s.parse::<MemberStatus>()? == MemberStatus::Active => Ok(()),
        Some(s) => Err(DomainError::Forbidden(format!("member {member_id} is {s}")).into()),
    }
}

pub async fn create_product(
    conn: &mut SqliteConnection,
    seller_id: i64,
    name: &str,
    price: i64,
) -> Result<i64> {
    if price <= 0 {
        return Err(DomainError::Validation("price must be positive".to_string()).into());
    }
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO products (seller_id, name, price, status) VALUES (?1, ?2, ?3, ?4) RETURNING id",
    )
    .bind(seller_id)
    .bind(name)
    .bind(price)
    .bind(ProductStatus::OnSale.as_str())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn set_product_status(
    conn: &mut SqliteConnection,
    product_id: i64,
    status: ProductStatus,
) -> Result<()> {
    sqlx::query("UPDATE products SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(product_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Put a product on the member's wishlist.
pub async fn add_wish_item(
    conn: &mut SqliteConnection,
    member_id: i64,
    product_id: i64,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO wish_items (wishlist_id, product_id, status, created_at)
        SELECT id, ?2, ?3, ?4 FROM wishlists WHERE member_id = ?1
        RETURNING id
        "#,
    )
    .bind(member_id)
    .bind(product_id)
    .bind(WishItemStatus::Available.as_str())
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DomainError::Validation(format!("member {member_id} has no wishlist")))?;
    Ok(id)
}

pub async fn load_wish_target(conn: &mut SqliteConnection, wish_item_id: i64) -> Result<WishTarget> {
    let target = sqlx::query_as::<_, WishTarget>(
        r#"
        SELECT w.id AS wish_item_id, l.member_id AS owner_id, p.id AS product_id,
               p.seller_id, p.price, p.status AS product_status, w.status AS wish_item_status
        FROM   wish_items w
        JOIN   wishlists l ON l.id = w.wishlist_id
        JOIN   products  p ON p.id = w.product_id
        WHERE  w.id = ?1
        "#,
    )
    .bind(wish_item_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DomainError::WishItemNotFound(wish_item_id))?;
    Ok(target)
}

pub async fn wish_item_status(
    conn: &mut SqliteConnection,
    wish_item_id: i64,
) -> Result<WishItemStatus> {
    let status: String = sqlx::query_scalar("SELECT status FROM wish_items WHERE id = ?1")
        .bind(wish_item_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DomainError::WishItemNotFound(wish_item_id))?;
    Ok(status.parse()?)
}

/// Re-derive the wish item's status from the funding that just changed.
pub async fn project_wish_item(
    conn: &mut SqliteConnection,
    wish_item_id: i64,
    funding: Option<FundingStatus>,
) -> Result<WishItemStatus> {
    let status = WishItemStatus::project(funding);
    sqlx::query("UPDATE wish_items SET status = ?1 WHERE id = ?2")
        .bind(status.as_str())
        .bind(wish_item_id)
        .execute(&mut *conn)
        .await?;
    Ok(status)
}
