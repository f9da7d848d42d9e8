//! Outbox relay: publishes committed domain events on the [`EventBus`].
//!
//! Events are read back from `domain_events` after commit, so subscribers
//! never see a change that was rolled back. The cursor starts at the newest
//! event present at startup; earlier events are available from `GET /events`.

use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::events::{self, EventBus};

const BATCH_SIZE: i64 = 100;

pub async fn run(pool: SqlitePool, bus: EventBus, interval: Duration, shutdown: CancellationToken) {
    let mut cursor = match pool.acquire().await {
        Ok(mut conn) => events::latest_id(&mut conn).await.unwrap_or(0),
        Err(e) => {
            error!("Event relay could not read its starting point: {e}");
            0
        }
    };
    info!("Event relay starting after event {cursor}");

    loop {
        match relay_once(&pool, &bus, cursor).await {
            Ok(next) => cursor = next,
            Err(e) => error!("Event relay poll error: {e}"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Event relay stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Publish everything after `cursor`; returns the new cursor.
pub async fn relay_once(pool: &SqlitePool, bus: &EventBus, cursor: i64) -> Result<i64> {
    let mut conn = pool.acquire().await?;
    let mut cursor = cursor;
    loop {
        let batch = events::since(&mut conn, cursor, BATCH_SIZE).await?;
        let Some(last) = batch.last() else {
            return Ok(cursor);
        };
        cursor = last.id;
        let count = batch.len();
        for event in batch {
            bus.publish(event);
        }
        debug!("Relayed {count} events up to {cursor}");
        if (count as i64) < BATCH_SIZE {
            return Ok(cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use giftfund_core::notify::EventKind;

    use super::*;
    use crate::db;
    use crate::events::NewEvent;

    #[tokio::test]
    async fn relays_only_new_events_in_order() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        {
            let mut conn = pool.acquire().await.unwrap();
            events::record(&mut conn, NewEvent::new(EventKind::FundingCreated, 1), 1)
                .await
                .unwrap();
        }
        let cursor = relay_once(&pool, &bus, 0).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::FundingCreated);

        {
            let mut conn = pool.acquire().await.unwrap();
            events::record(&mut conn, NewEvent::new(EventKind::FundingRefused, 1), 2)
                .await
                .unwrap();
        }
        let next = relay_once(&pool, &bus, cursor).await.unwrap();
        assert!(next > cursor);
        assert_eq!(rx.try_recv().unwrap().kind(), EventKind::FundingRefused);
        assert!(rx.try_recv().is_err());
    }
}
