//! Funding accumulator: persistence of funding campaigns and contributions.
//!
//! Every write to `fundings` is a compare-and-swap against the
//! `(current_amount, status)` pair that was read, so two contributors racing
//! on the same funding can never both pass the capacity check. A lost race
//! re-reads and re-evaluates the rules. Callers hold the write lock from the
//! start of their transaction (`db::begin_write`), so concurrent writers
//! queue instead of failing the lock upgrade.

use giftfund_core::funding::{Decision, NewFunding};
use giftfund_core::notify::EventKind;
use giftfund_core::{DomainError, Funding, FundingParticipant, FundingStatus, OrderItemStatus};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::catalog;
use crate::config::Rules;
use crate::errors::Result;
use crate::events::{self, NewEvent};
use crate::models::{FundingRow, ParticipantRow, FUNDING_COLUMNS};

const MAX_CAS_ATTEMPTS: usize = 3;

pub async fn load(conn: &mut SqliteConnection, funding_id: i64) -> Result<Funding> {
    let row = sqlx::query_as::<_, FundingRow>(&format!(
        "SELECT {FUNDING_COLUMNS} FROM fundings WHERE id = ?1"
    ))
    .bind(funding_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DomainError::FundingNotFound(funding_id))?;
    row.try_into()
}

/// The non-terminal funding currently attached to a wish item, if any.
pub async fn active_for_wish_item(
    conn: &mut SqliteConnection,
    wish_item_id: i64,
) -> Result<Option<Funding>> {
    let row = sqlx::query_as::<_, FundingRow>(&format!(
        "SELECT {FUNDING_COLUMNS} FROM fundings
         WHERE wish_item_id = ?1 AND status IN ('PENDING', 'IN_PROGRESS', 'ACHIEVED')"
    ))
    .bind(wish_item_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Funding::try_from).transpose()
}

pub async fn participants(
    conn: &mut SqliteConnection,
    funding_id: i64,
) -> Result<Vec<FundingParticipant>> {
    let rows = sqlx::query_as::<_, ParticipantRow>(
        r#"
        SELECT funding_id, member_id, amount, is_organizer, participated_at
        FROM   funding_participants
        WHERE  funding_id = ?1
        ORDER  BY participated_at ASC, member_id ASC
        "#,
    )
    .bind(funding_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(FundingParticipant::from).collect())
}

async fn participant(
    conn: &mut SqliteConnection,
    funding_id: i64,
    member_id: i64,
) -> Result<Option<FundingParticipant>> {
    let row = sqlx::query_as::<_, ParticipantRow>(
        r#"
        SELECT funding_id, member_id, amount, is_organizer, participated_at
        FROM   funding_participants
        WHERE  funding_id = ?1 AND member_id = ?2
        "#,
    )
    .bind(funding_id)
    .bind(member_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(FundingParticipant::from))
}

/// Materialize a funding in `PENDING`.
///
/// Fails with `CONFLICT` when the wish item already has a non-terminal funding.
pub async fn create_funding(
    conn: &mut SqliteConnection,
    new: &NewFunding,
    now: i64,
) -> Result<Funding> {
    new.validate()?;
    if let Some(existing) = active_for_wish_item(conn, new.wish_item_id).await? {
        return Err(DomainError::Conflict(format!(
            "wish item {} already has active funding {}",
            new.wish_item_id, existing.id
        ))
        .into());
    }

    let row = sqlx::query_as::<_, FundingRow>(&format!(
        "INSERT INTO fundings
            (wish_item_id, organizer_id, recipient_id, target_amount, current_amount,
             participant_count, status, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6, ?7)
         RETURNING {FUNDING_COLUMNS}"
    ))
    .bind(new.wish_item_id)
    .bind(new.organizer_id)
    .bind(new.recipient_id)
    .bind(new.target_amount)
    .bind(FundingStatus::Pending.as_str())
    .bind(new.expires_at(now))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    let funding: Funding = row.try_into()?;

    catalog::project_wish_item(conn, funding.wish_item_id, Some(funding.status)).await?;
    events::record(
        conn,
        NewEvent::new(EventKind::FundingCreated, funding.id)
            .by(funding.organizer_id)
            .amount(funding.target_amount),
        now,
    )
    .await?;

    info!(
        "Funding {} created for wish item {} (target {})",
        funding.id, funding.wish_item_id, funding.target_amount
    );
    Ok(funding)
}

/// Write the computed next state iff the row still holds `before`.
async fn swap_state(conn: &mut SqliteConnection, before: &Funding, after: &Funding) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE fundings
        SET    current_amount = ?1, participant_count = ?2, status = ?3,
               achieved_at = ?4, decided_at = ?5, refuse_reason = ?6
        WHERE  id = ?7 AND current_amount = ?8 AND status = ?9
        "#,
    )
    .bind(after.current_amount)
    .bind(after.participant_count)
    .bind(after.status.as_str())
    .bind(after.achieved_at)
    .bind(after.decided_at)
    .bind(&after.refuse_reason)
    .bind(before.id)
    .bind(before.current_amount)
    .bind(before.status.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

async fn save_participant(conn: &mut SqliteConnection, row: &FundingParticipant) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO funding_participants (funding_id, member_id, amount, is_organizer, participated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (funding_id, member_id) DO UPDATE SET amount = excluded.amount
        "#,
    )
    .bind(row.funding_id)
    .bind(row.member_id)
    .bind(row.amount)
    .bind(row.is_organizer)
    .bind(row.participated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Capture a paid contribution into the funding.
///
/// Must run inside the same transaction as the wallet debit that pays for it.
pub async fn apply_contribution(
    conn: &mut SqliteConnection,
    funding_id: i64,
    member_id: i64,
    amount: i64,
    rules: &Rules,
    now: i64,
) -> Result<FundingParticipant> {
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let before = load(conn, funding_id).await?;
        let mut after = before.clone();
        after.apply_contribution(amount, rules.min_contribution, now)?;

        let existing = participant(conn, funding_id, member_id).await?;
        let (row, first) = FundingParticipant::accumulate(existing, &after, member_id, amount, now);
        if first {
            after.participant_count += 1;
        }

        if !swap_state(conn, &before, &after).await? {
            warn!("Funding {funding_id} changed concurrently (attempt {attempt}), retrying");
            continue;
        }
        save_participant(conn, &row).await?;

        events::record(
            conn,
            NewEvent::new(EventKind::FundingParticipated, funding_id)
                .by(member_id)
                .amount(amount),
            now,
        )
        .await?;
        if after.status == FundingStatus::Achieved {
            events::record(conn, NewEvent::new(EventKind::FundingAchieved, funding_id), now).await?;
            info!("Funding {funding_id} achieved its target of {}", after.target_amount);
        }

        info!(
            "Member {member_id} contributed {amount} to funding {funding_id} ({}/{})",
            after.current_amount, after.target_amount
        );
        return Ok(row);
    }

    Err(DomainError::Conflict(format!(
        "funding {funding_id} is under heavy contention, please retry"
    ))
    .into())
}

/// Undo a contribution symmetrically to how it was applied.
pub async fn reverse_contribution(
    conn: &mut SqliteConnection,
    funding_id: i64,
    member_id: i64,
    amount: i64,
) -> Result<Funding> {
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let before = load(conn, funding_id).await?;
        let mut after = before.clone();
        after.reverse_contribution(amount)?;

        let row = participant(conn, funding_id, member_id).await?.ok_or_else(|| {
            DomainError::Conflict(format!(
                "member {member_id} has no contribution in funding {funding_id}"
            ))
        })?;
        let remaining = row.reduce(amount)?;
        if remaining.is_none() {
            after.participant_count -= 1;
        }

        if !swap_state(conn, &before, &after).await? {
            warn!("Funding {funding_id} changed concurrently (attempt {attempt}), retrying");
            continue;
        }
        match remaining {
            Some(row) => save_participant(conn, &row).await?,
            None => {
                sqlx::query(
                    "DELETE FROM funding_participants WHERE funding_id = ?1 AND member_id = ?2",
                )
                .bind(funding_id)
                .bind(member_id)
                .execute(&mut *conn)
                .await?;
            }
        }

        info!("Reversed {amount} of member {member_id} from funding {funding_id}");
        return Ok(after);
    }

    Err(DomainError::Conflict(format!(
        "funding {funding_id} is under heavy contention, please retry"
    ))
    .into())
}

/// Expire a single funding whose deadline has passed.
pub async fn expire(conn: &mut SqliteConnection, funding_id: i64, now: i64) -> Result<Funding> {
    let before = load(conn, funding_id).await?;
    let mut after = before.clone();
    after.expire(now)?;

    if !swap_state(conn, &before, &after).await? {
        return Err(DomainError::Conflict(format!(
            "funding {funding_id} changed while expiring"
        ))
        .into());
    }
    catalog::project_wish_item(conn, after.wish_item_id, Some(after.status)).await?;
    events::record(conn, NewEvent::new(EventKind::FundingExpired, funding_id), now).await?;

    info!(
        "Funding {funding_id} expired holding {} of {}",
        after.current_amount, after.target_amount
    );
    Ok(after)
}

/// Ids of PENDING / IN_PROGRESS fundings whose deadline is before `now`.
pub async fn due_for_expiry(conn: &mut SqliteConnection, now: i64) -> Result<Vec<i64>> {
    let due = sqlx::query_scalar(
        "SELECT id FROM fundings WHERE status IN ('PENDING', 'IN_PROGRESS') AND expires_at < ?1 ORDER BY id",
    )
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;
    Ok(due)
}

/// Close a funding opened by a checkout that was never paid, once no unpaid
/// order line points at it any more. Returns `None` when the funding holds
/// money, has moved on, or is still referenced.
pub async fn release_if_abandoned(
    conn: &mut SqliteConnection,
    funding_id: i64,
    now: i64,
) -> Result<Option<Funding>> {
    let before = load(conn, funding_id).await?;
    if before.status != FundingStatus::Pending || before.current_amount != 0 {
        return Ok(None);
    }
    let open_lines: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM order_items WHERE funding_id = ?1 AND status = ?2",
    )
    .bind(funding_id)
    .bind(OrderItemStatus::Created.as_str())
    .fetch_one(&mut *conn)
    .await?;
    if open_lines > 0 {
        return Ok(None);
    }

    let mut after = before.clone();
    after.abandon()?;
    if !swap_state(conn, &before, &after).await? {
        return Err(DomainError::Conflict(format!(
            "funding {funding_id} changed while being released"
        ))
        .into());
    }
    catalog::project_wish_item(conn, after.wish_item_id, Some(after.status)).await?;
    events::record(conn, NewEvent::new(EventKind::FundingExpired, funding_id), now).await?;

    info!("Funding {funding_id} released: its checkout was abandoned");
    Ok(Some(after))
}

/// Recipient accepts or refuses an achieved funding.
pub async fn decide(
    conn: &mut SqliteConnection,
    funding_id: i64,
    caller_id: i64,
    decision: Decision,
    now: i64,
) -> Result<Funding> {
    let before = load(conn, funding_id).await?;
    let mut after = before.clone();
    let status = after.decide(caller_id, decision, now)?;

    if !swap_state(conn, &before, &after).await? {
        return Err(DomainError::Conflict(format!(
            "funding {funding_id} changed while deciding"
        ))
        .into());
    }
    catalog::project_wish_item(conn, after.wish_item_id, Some(status)).await?;

    let kind = match status {
        FundingStatus::Accepted => EventKind::FundingAccepted,
        _ => EventKind::FundingRefused,
    };
    events::record(
        conn,
        NewEvent::new(kind, funding_id)
            .by(caller_id)
            .amount(after.current_amount),
        now,
    )
    .await?;

    info!("Funding {funding_id} {status} by recipient {caller_id}");
    Ok(after)
}
