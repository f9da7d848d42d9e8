//! Domain event outbox and in-process bus.
//!
//! State changes append a row to `domain_events` inside the same transaction
//! as the change itself, so an event exists if and only if its change
//! committed. The relay task ([`crate::relay`]) later fans committed rows out
//! on the [`EventBus`]; the external refund process subscribes there for
//! `funding_refused`.

use giftfund_core::notify::EventKind;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tokio::sync::broadcast;

use crate::errors::Result;

/// An event about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub entity_id: i64,
    pub member_id: Option<i64>,
    pub amount: Option<i64>,
}

impl NewEvent {
    pub fn new(kind: EventKind, entity_id: i64) -> Self {
        Self {
            kind,
            entity_id,
            member_id: None,
            amount: None,
        }
    }

    pub fn by(mut self, member_id: i64) -> Self {
        self.member_id = Some(member_id);
        self
    }

    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// An event record as stored in / read from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: i64,
    pub member_id: Option<i64>,
    pub amount: Option<i64>,
    pub created_at: i64,
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.event_type)
    }
}

pub async fn record(conn: &mut SqliteConnection, event: NewEvent, now: i64) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO domain_events (event_type, entity_type, entity_id, member_id, amount, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING id
        "#,
    )
    .bind(event.kind.as_str())
    .bind(event.kind.entity_type())
    .bind(event.entity_id)
    .bind(event.member_id)
    .bind(event.amount)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Events for one entity, oldest first.
pub async fn for_entity(
    conn: &mut SqliteConnection,
    entity_type: &str,
    entity_id: i64,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_type, entity_type, entity_id, member_id, amount, created_at
        FROM   domain_events
        WHERE  entity_type = ?1 AND entity_id = ?2
        ORDER  BY id ASC
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Events with `id > after`, oldest first.
pub async fn since(conn: &mut SqliteConnection, after: i64, limit: i64) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_type, entity_type, entity_id, member_id, amount, created_at
        FROM   domain_events
        WHERE  id > ?1
        ORDER  BY id ASC
        LIMIT  ?2
        "#,
    )
    .bind(after)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

pub async fn latest_id(conn: &mut SqliteConnection) -> Result<i64> {
    let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM domain_events")
        .fetch_one(&mut *conn)
        .await?;
    Ok(id.unwrap_or(0))
}

/// Fan-out of committed events to in-process subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers reached; zero is not an error.
    pub fn publish(&self, event: EventRecord) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
