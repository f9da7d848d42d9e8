//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use giftfund_core::funding::NewFunding;
use giftfund_core::{Funding, MemberRole, TransactionType};
use settlement::{catalog, db, funding, wallet};
use sqlx::SqlitePool;

pub const NOW: i64 = 1_700_000_000;
pub const DAY: i64 = 86_400;

/// A seller with two products on the recipient's wishlist, and three
/// buyers with empty wallets.
pub struct World {
    pub pool: SqlitePool,
    pub seller: i64,
    pub recipient: i64,
    pub alice: i64,
    pub bob: i64,
    pub carol: i64,
    /// Priced 100,000.
    pub camera: i64,
    /// Priced 50,000.
    pub lamp: i64,
    pub camera_wish: i64,
    pub lamp_wish: i64,
    /// Database file removed on drop; `None` for in-memory worlds.
    file: Option<PathBuf>,
}

impl Drop for World {
    fn drop(&mut self) {
        if let Some(path) = &self.file {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// In-memory world behind a single-connection pool.
pub async fn world(now: i64) -> World {
    seed("sqlite::memory:", None, now).await
}

/// The same world in a fresh database file, behind the multi-connection
/// pool the service runs with.
pub async fn file_world(now: i64) -> World {
    let path = std::env::temp_dir().join(format!("giftfund-test-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite:{}", path.display());
    seed(&url, Some(path), now).await
}

async fn seed(url: &str, file: Option<PathBuf>, now: i64) -> World {
    let pool = db::init_pool(url).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();

    let seller = catalog::create_member(&mut conn, "seller", MemberRole::Seller, now)
        .await
        .unwrap();
    let recipient = catalog::create_member(&mut conn, "recipient", MemberRole::User, now)
        .await
        .unwrap();
    let alice = catalog::create_member(&mut conn, "alice", MemberRole::User, now)
        .await
        .unwrap();
    let bob = catalog::create_member(&mut conn, "bob", MemberRole::User, now)
        .await
        .unwrap();
    let carol = catalog::create_member(&mut conn, "carol", MemberRole::User, now)
        .await
        .unwrap();

    let camera = catalog::create_product(&mut conn, seller, "camera", 100_000)
        .await
        .unwrap();
    let lamp = catalog::create_product(&mut conn, seller, "lamp", 50_000)
        .await
        .unwrap();
    let camera_wish = catalog::add_wish_item(&mut conn, recipient, camera, now)
        .await
        .unwrap();
    let lamp_wish = catalog::add_wish_item(&mut conn, recipient, lamp, now)
        .await
        .unwrap();
    drop(conn);

    World {
        pool,
        seller,
        recipient,
        alice,
        bob,
        carol,
        camera,
        lamp,
        camera_wish,
        lamp_wish,
        file,
    }
}

impl World {
    pub async fn fund_wallet(&self, member_id: i64, amount: i64) {
        let mut conn = self.pool.acquire().await.unwrap();
        wallet::credit(
            &mut conn,
            member_id,
            TransactionType::Charge,
            amount,
            "Card charge",
            None,
            NOW,
        )
        .await
        .unwrap();
    }

    pub async fn balance(&self, member_id: i64) -> i64 {
        let mut conn = self.pool.acquire().await.unwrap();
        wallet::load(&mut conn, member_id).await.unwrap().balance
    }

    pub async fn open_funding(&self, wish_item_id: i64, target: i64, days: i64) -> Funding {
        let mut conn = self.pool.acquire().await.unwrap();
        funding::create_funding(
            &mut conn,
            &NewFunding {
                wish_item_id,
                organizer_id: self.recipient,
                recipient_id: self.recipient,
                target_amount: target,
                expires_in_days: days,
            },
            NOW,
        )
        .await
        .unwrap()
    }

    pub async fn funding(&self, funding_id: i64) -> Funding {
        let mut conn = self.pool.acquire().await.unwrap();
        funding::load(&mut conn, funding_id).await.unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    /// Check every funding and wallet against the pipeline invariants.
    pub async fn assert_consistent(&self) {
        let mut conn = self.pool.acquire().await.unwrap();
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM fundings")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        for id in ids {
            let f = funding::load(&mut conn, id).await.unwrap();
            let participants = funding::participants(&mut conn, id).await.unwrap();
            giftfund_core::invariants::assert_all_funding_invariants(&f, &participants);
        }

        let members: Vec<i64> = sqlx::query_scalar("SELECT member_id FROM wallets")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        for member in members {
            let w = wallet::load(&mut conn, member).await.unwrap();
            let history = wallet::journal(&mut conn, member).await.unwrap();
            giftfund_core::invariants::assert_ledger_consistent(&w, &history);
        }
    }
}
