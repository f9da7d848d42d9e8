//! Wallet ledger: balance mutations and their transaction history.
//!
//! A balance only ever changes through [`apply`], which performs a
//! conditional `UPDATE … RETURNING balance` and appends the matching
//! `wallet_transactions` row with that returned balance as `balance_after`.

use giftfund_core::ledger;
use giftfund_core::notify::EventKind;
use giftfund_core::{DomainError, TransactionType, Wallet, WalletTransaction};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::db::Page;
use crate::errors::Result;
use crate::events::{self, NewEvent};
use crate::models::{WalletRow, WalletTxRow, WALLET_TX_COLUMNS};

pub async fn load(conn: &mut SqliteConnection, member_id: i64) -> Result<Wallet> {
    let row = sqlx::query_as::<_, WalletRow>(
        "SELECT member_id, balance, updated_at FROM wallets WHERE member_id = ?1",
    )
    .bind(member_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DomainError::WalletNotFound(member_id))?;
    Ok(row.into())
}

/// Move `magnitude` in the direction of `tx_type` and journal it.
pub async fn apply(
    conn: &mut SqliteConnection,
    member_id: i64,
    tx_type: TransactionType,
    magnitude: i64,
    description: &str,
    related_id: Option<i64>,
    now: i64,
) -> Result<WalletTransaction> {
    ledger::check_magnitude(magnitude)?;
    let signed = tx_type.signed(magnitude);

    let balance_after: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE wallets
        SET    balance = balance + ?1, updated_at = ?3
        WHERE  member_id = ?2 AND balance + ?1 >= 0
        RETURNING balance
        "#,
    )
    .bind(signed)
    .bind(member_id)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(balance_after) = balance_after else {
        // Either the wallet is missing or the debit would go negative.
        let wallet = load(conn, member_id).await?;
        warn!(
            "Wallet {member_id} rejected {tx_type} of {magnitude} (balance {})",
            wallet.balance
        );
        return Err(DomainError::InsufficientBalance {
            balance: wallet.balance,
            required: magnitude,
        }
        .into());
    };

    let row = sqlx::query_as::<_, WalletTxRow>(&format!(
        "INSERT INTO wallet_transactions
            (member_id, tx_type, amount, balance_after, description, related_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING {WALLET_TX_COLUMNS}"
    ))
    .bind(member_id)
    .bind(tx_type.as_str())
    .bind(signed)
    .bind(balance_after)
    .bind(description)
    .bind(related_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    info!("Wallet {member_id}: {tx_type} {signed:+} -> {balance_after}");
    row.try_into()
}

pub async fn credit(
    conn: &mut SqliteConnection,
    member_id: i64,
    tx_type: TransactionType,
    amount: i64,
    description: &str,
    related_id: Option<i64>,
    now: i64,
) -> Result<WalletTransaction> {
    debug_assert!(tx_type.sign() > 0);
    apply(conn, member_id, tx_type, amount, description, related_id, now).await
}

pub async fn debit(
    conn: &mut SqliteConnection,
    member_id: i64,
    tx_type: TransactionType,
    amount: i64,
    description: &str,
    related_id: Option<i64>,
    now: i64,
) -> Result<WalletTransaction> {
    debug_assert!(tx_type.sign() < 0);
    apply(conn, member_id, tx_type, amount, description, related_id, now).await
}

/// Cash out part of the balance.
pub async fn withdraw(
    conn: &mut SqliteConnection,
    member_id: i64,
    amount: i64,
    now: i64,
) -> Result<WalletTransaction> {
    let tx = debit(
        conn,
        member_id,
        TransactionType::Withdraw,
        amount,
        "Withdrawal",
        None,
        now,
    )
    .await?;
    events::record(
        conn,
        NewEvent::new(EventKind::WalletWithdrawn, member_id)
            .by(member_id)
            .amount(amount),
        now,
    )
    .await?;
    Ok(tx)
}

/// Paged history, newest first, optionally restricted to one type.
pub async fn history(
    conn: &mut SqliteConnection,
    member_id: i64,
    tx_type: Option<TransactionType>,
    page: Page,
) -> Result<Vec<WalletTransaction>> {
    let rows = sqlx::query_as::<_, WalletTxRow>(&format!(
        "SELECT {WALLET_TX_COLUMNS} FROM wallet_transactions
         WHERE member_id = ?1 AND (?2 IS NULL OR tx_type = ?2)
         ORDER BY id DESC
         LIMIT ?3 OFFSET ?4"
    ))
    .bind(member_id)
    .bind(tx_type.map(|t| t.as_str()))
    .bind(page.size)
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(WalletTransaction::try_from).collect()
}

/// Complete history, oldest first, for ledger replay.
pub async fn journal(conn: &mut SqliteConnection, member_id: i64) -> Result<Vec<WalletTransaction>> {
    let rows = sqlx::query_as::<_, WalletTxRow>(&format!(
        "SELECT {WALLET_TX_COLUMNS} FROM wallet_transactions WHERE member_id = ?1 ORDER BY id ASC"
    ))
    .bind(member_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(WalletTransaction::try_from).collect()
}
