//! Background task that expires fundings whose deadline has passed.

use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::Result;
use crate::{funding, orders};

/// Sweep every `interval` until `shutdown` fires.
pub async fn run(pool: SqlitePool, interval: Duration, shutdown: CancellationToken) {
    info!("Expiry scheduler starting (every {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Expiry scheduler stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(&pool, db::now()).await {
                    error!("Expiry sweep error: {e}");
                }
            }
        }
    }
}

/// Expire everything due at `now`, one transaction per funding. A funding
/// that fails is logged and left for the next sweep; the rest still commit.
pub async fn sweep_once(pool: &SqlitePool, now: i64) -> Result<Vec<i64>> {
    let due = {
        let mut conn = pool.acquire().await?;
        funding::due_for_expiry(&mut conn, now).await?
    };

    let mut expired = Vec::with_capacity(due.len());
    for funding_id in due {
        match expire_one(pool, funding_id, now).await {
            Ok(()) => expired.push(funding_id),
            Err(e) => warn!("Could not expire funding {funding_id}: {e}"),
        }
    }

    if !expired.is_empty() {
        info!("Expired {} funding(s): {expired:?}", expired.len());
    }
    Ok(expired)
}

async fn expire_one(pool: &SqlitePool, funding_id: i64, now: i64) -> Result<()> {
    let mut tx = db::begin_write(pool).await?;
    funding::expire(&mut tx, funding_id, now).await?;
    let canceled = orders::cancel_unpayable(&mut tx, funding_id, now).await?;
    tx.commit().await?;

    if !canceled.is_empty() {
        info!("Canceled unpaid order(s) {canceled:?} of expired funding {funding_id}");
    }
    Ok(())
}
