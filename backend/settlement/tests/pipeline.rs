//! End-to-end pipeline tests against a seeded database.

mod common;

use std::sync::Arc;

use common::{file_world, world, World, DAY, NOW};
use giftfund_core::funding::Decision;
use giftfund_core::notify::EventKind;
use giftfund_core::{
    CartItem, CartItemStatus, CartTargetType, ErrorCode, FundingStatus, MemberRole, MemberStatus,
    OrderItemStatus, OrderItemType, OrderStatus, Payment, PaymentMethod, PaymentStatus,
    TransactionType, WishItemStatus,
};
use settlement::cart::{self, CartTarget};
use settlement::config::Rules;
use settlement::errors::Result;
use settlement::events::EventBus;
use settlement::gateway::{MockBehavior, MockGateway};
use settlement::orders::{self, NewOrder, OrderDetail};
use settlement::payments::{self, ChargeConfirmation};
use settlement::{catalog, db, funding, relay, scheduler, wallet};

async fn stage(w: &World, member: i64, target: CartTarget, amount: i64) -> CartItem {
    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let item = cart::add_item(&mut tx, member, target, amount, &Rules::default(), NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    item
}

fn checkout(ids: &[i64], key: Option<&str>, defer_payment: bool) -> NewOrder {
    NewOrder {
        cart_item_ids: ids.to_vec(),
        payment_method: PaymentMethod::Wallet,
        defer_payment,
        idempotency_key: key.map(str::to_string),
    }
}

/// Run `create_order` in its own transaction, committing only on success.
async fn place(w: &World, member: i64, request: &NewOrder, now: i64) -> Result<OrderDetail> {
    let mut tx = db::begin_write(&w.pool).await?;
    let detail = orders::create_order(&mut tx, member, request, &Rules::default(), now).await?;
    tx.commit().await?;
    Ok(detail)
}

async fn participate(w: &World, member: i64, funding_id: i64, amount: i64) -> Result<()> {
    let mut tx = db::begin_write(&w.pool).await?;
    payments::participate(&mut tx, member, funding_id, amount, &Rules::default(), NOW).await?;
    tx.commit().await?;
    Ok(())
}

async fn cart_len(w: &World, member: i64, now: i64) -> usize {
    let mut conn = w.pool.acquire().await.unwrap();
    cart::list_items(&mut conn, member, now).await.unwrap().items.len()
}

// ─────────────────────────────────────────────────────────
// Funding accumulation
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn two_contributions_reach_the_target() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 60_000).await;
    w.fund_wallet(w.bob, 40_000).await;
    let f = w.open_funding(w.camera_wish, 100_000, 14).await;

    participate(&w, w.alice, f.id, 60_000).await.unwrap();
    let after_a = w.funding(f.id).await;
    assert_eq!(after_a.status, FundingStatus::InProgress);
    assert_eq!(after_a.current_amount, 60_000);

    participate(&w, w.bob, f.id, 40_000).await.unwrap();
    let after_b = w.funding(f.id).await;
    assert_eq!(after_b.status, FundingStatus::Achieved);
    assert_eq!(after_b.current_amount, 100_000);
    assert_eq!(after_b.participant_count, 2);
    assert!(after_b.achieved_at.is_some());

    assert_eq!(w.balance(w.alice).await, 0);
    assert_eq!(w.balance(w.bob).await, 0);
    w.assert_consistent().await;
}

#[tokio::test]
async fn overshoot_is_rejected_and_nothing_moves() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 60_000).await;
    w.fund_wallet(w.carol, 50_000).await;
    let f = w.open_funding(w.camera_wish, 100_000, 14).await;
    participate(&w, w.alice, f.id, 60_000).await.unwrap();

    let err = participate(&w, w.carol, f.id, 50_000).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExceedRemainingAmount);
    let details = err.to_body().details.unwrap();
    assert_eq!(details["remainingAmount"], 40_000);

    assert_eq!(w.funding(f.id).await.current_amount, 60_000);
    assert_eq!(w.balance(w.carol).await, 50_000);
    w.assert_consistent().await;
}

#[tokio::test]
async fn concurrent_contributions_never_overshoot() {
    let w = Arc::new(file_world(NOW).await);
    let f = w.open_funding(w.camera_wish, 100_000, 14).await;

    let mut members = Vec::new();
    for i in 0..10 {
        let mut conn = w.pool.acquire().await.unwrap();
        let m = catalog::create_member(&mut conn, &format!("fan{i}"), MemberRole::User, NOW)
            .await
            .unwrap();
        drop(conn);
        w.fund_wallet(m, 20_000).await;
        members.push(m);
    }

    let funding_id = f.id;
    let handles: Vec<_> = members
        .iter()
        .map(|&m| {
            let w = Arc::clone(&w);
            tokio::spawn(async move {
                participate(&w, m, funding_id, 15_000)
                    .await
                    .map_err(|e| e.code())
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(code) => assert_eq!(code, ErrorCode::ExceedRemainingAmount),
        }
    }

    let end = w.funding(f.id).await;
    assert_eq!(accepted, 6);
    assert_eq!(end.current_amount, 90_000);
    assert_eq!(end.participant_count, 6);
    assert_eq!(end.status, FundingStatus::InProgress);

    let mut untouched = 0;
    for &m in &members {
        if w.balance(m).await == 20_000 {
            untouched += 1;
        }
    }
    assert_eq!(untouched, 4);
    w.assert_consistent().await;
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn checkout_materializes_funding_and_pays_from_wallet() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 100_000).await;

    let item = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 30_000).await;
    assert_eq!(item.target_type, CartTargetType::FundingPending);

    let detail = place(&w, w.alice, &checkout(&[item.id], None, false), NOW)
        .await
        .unwrap();
    assert_eq!(detail.order.status, OrderStatus::Paid);
    assert_eq!(detail.order.total_amount, 30_000);
    assert!(detail.order.order_number.starts_with("ORD-"));
    assert_eq!(detail.items.len(), 1);

    let line = &detail.items[0];
    assert_eq!(line.order_item_type, OrderItemType::FundingGift);
    assert_eq!(line.seller_id, w.seller);
    assert_eq!(line.receiver_id, w.recipient);
    assert_eq!(line.price, 100_000);
    assert_eq!(line.amount, 30_000);

    let f = w.funding(line.funding_id.unwrap()).await;
    assert_eq!(f.organizer_id, w.alice);
    assert_eq!(f.target_amount, 100_000);
    assert_eq!(f.current_amount, 30_000);
    assert_eq!(f.status, FundingStatus::InProgress);

    let mut conn = w.pool.acquire().await.unwrap();
    let participants = funding::participants(&mut conn, f.id).await.unwrap();
    assert!(participants[0].is_organizer);
    assert_eq!(
        catalog::wish_item_status(&mut conn, w.camera_wish).await.unwrap(),
        WishItemStatus::InFunding
    );
    drop(conn);

    assert_eq!(w.balance(w.alice).await, 70_000);
    assert_eq!(cart_len(&w, w.alice, NOW).await, 0);
    w.assert_consistent().await;
}

#[tokio::test]
async fn one_ended_item_rejects_the_whole_order() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 100_000).await;
    let short = w.open_funding(w.lamp_wish, 50_000, 1).await;

    let good = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 20_000).await;
    let doomed = stage(&w, w.alice, CartTarget::Funding(short.id), 10_000).await;

    let later = NOW + 2 * DAY;
    let err = place(&w, w.alice, &checkout(&[good.id, doomed.id], None, false), later)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(err.to_string().contains(&format!("cart item {}", doomed.id)));

    assert_eq!(w.count("orders").await, 0);
    assert_eq!(w.count("order_items").await, 0);
    assert_eq!(cart_len(&w, w.alice, later).await, 2);
    assert_eq!(w.balance(w.alice).await, 100_000);

    // The valid line's funding was never materialized.
    let mut conn = w.pool.acquire().await.unwrap();
    assert!(funding::active_for_wish_item(&mut conn, w.camera_wish)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn failed_wallet_payment_rolls_back_the_checkout() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 5_000).await;
    let item = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 10_000).await;

    let err = place(&w, w.alice, &checkout(&[item.id], None, false), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientBalance);

    assert_eq!(w.count("orders").await, 0);
    assert_eq!(w.count("fundings").await, 0);
    assert_eq!(cart_len(&w, w.alice, NOW).await, 1);
    assert_eq!(w.balance(w.alice).await, 5_000);
}

#[tokio::test]
async fn lines_for_one_funding_are_checked_together() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 200_000).await;

    let pending = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 60_000).await;
    assert_eq!(pending.target_type, CartTargetType::FundingPending);
    let f = w.open_funding(w.camera_wish, 100_000, 14).await;
    let direct = stage(&w, w.alice, CartTarget::Funding(f.id), 50_000).await;

    let err = place(&w, w.alice, &checkout(&[pending.id, direct.id], None, false), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    let details = err.to_body().details.unwrap();
    assert_eq!(details["cartItemId"], direct.id);
    assert_eq!(details["reason"], "EXCEED_REMAINING_AMOUNT");
    assert_eq!(details["remainingAmount"], 40_000);
    assert_eq!(w.funding(f.id).await.current_amount, 0);
    assert_eq!(w.count("orders").await, 0);
}

#[tokio::test]
async fn idempotency_key_replays_the_same_order() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 100_000).await;
    let a = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 10_000).await;
    let b = stage(&w, w.alice, CartTarget::WishItem(w.lamp_wish), 10_000).await;

    let first = place(&w, w.alice, &checkout(&[a.id, b.id], Some("k-1"), false), NOW)
        .await
        .unwrap();
    // Same snapshot in a different order.
    let again = place(&w, w.alice, &checkout(&[b.id, a.id], Some("k-1"), false), NOW)
        .await
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(w.count("orders").await, 1);
    assert_eq!(w.balance(w.alice).await, 80_000);

    let err = place(&w, w.alice, &checkout(&[a.id], Some("k-1"), false), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert_eq!(w.count("orders").await, 1);
}

#[tokio::test]
async fn checkout_rejects_empty_and_repeated_ids() {
    let w = world(NOW).await;
    let a = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 10_000).await;

    let err = place(&w, w.alice, &checkout(&[], None, false), NOW).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    let err = place(&w, w.alice, &checkout(&[a.id, a.id], None, false), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    // Someone else's cart item is not found.
    let err = place(&w, w.bob, &checkout(&[a.id], None, false), NOW).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CartItemNotFound);
}

#[tokio::test]
async fn deferred_order_with_short_wallet_stays_created() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 5_000).await;
    let item = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 10_000).await;

    let detail = place(&w, w.alice, &checkout(&[item.id], None, true), NOW)
        .await
        .unwrap();
    assert_eq!(detail.order.status, OrderStatus::Created);
    assert_eq!(detail.order.total_amount, 10_000);

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = payments::pay_with_wallet(&mut tx, w.alice, detail.order.id, &Rules::default(), NOW)
        .await
        .unwrap_err();
    drop(tx);
    assert_eq!(err.code(), ErrorCode::InsufficientBalance);
    assert_eq!(
        err.to_body().details.unwrap()["balance"],
        serde_json::json!(5_000)
    );

    let mut conn = w.pool.acquire().await.unwrap();
    let order = orders::load(&mut conn, w.alice, detail.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Created);
    drop(conn);
    assert_eq!(w.balance(w.alice).await, 5_000);

    // Topping up lets the same order go through.
    w.fund_wallet(w.alice, 5_000).await;
    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let payment = payments::pay_with_wallet(&mut tx, w.alice, detail.order.id, &Rules::default(), NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.paid_amount, 10_000);
    assert_eq!(w.balance(w.alice).await, 0);
    w.assert_consistent().await;
}

#[tokio::test]
async fn cancel_reverses_contributions_and_refunds() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 60_000).await;
    w.fund_wallet(w.bob, 40_000).await;

    let item = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 60_000).await;
    let detail = place(&w, w.alice, &checkout(&[item.id], None, false), NOW)
        .await
        .unwrap();
    let funding_id = detail.items[0].funding_id.unwrap();
    participate(&w, w.bob, funding_id, 40_000).await.unwrap();
    assert_eq!(w.funding(funding_id).await.status, FundingStatus::Achieved);

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let canceled = orders::cancel(&mut tx, w.alice, detail.order.id, NOW + 60)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(canceled.order.status, OrderStatus::Canceled);
    assert!(canceled.order.cancelled_at.is_some());

    let f = w.funding(funding_id).await;
    assert_eq!(f.status, FundingStatus::InProgress);
    assert_eq!(f.current_amount, 40_000);
    assert_eq!(f.participant_count, 1);
    assert!(f.achieved_at.is_none());
    assert_eq!(w.balance(w.alice).await, 60_000);

    let mut conn = w.pool.acquire().await.unwrap();
    let history = wallet::journal(&mut conn, w.alice).await.unwrap();
    assert_eq!(history.last().unwrap().tx_type, TransactionType::Refund);
    let status: String = sqlx::query_scalar("SELECT status FROM payments WHERE order_id = ?1")
        .bind(detail.order.id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
    assert_eq!(status, "REFUNDED");
    drop(conn);

    w.assert_consistent().await;
}

#[tokio::test]
async fn accepted_funding_blocks_cancellation() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 50_000).await;

    let item = stage(&w, w.alice, CartTarget::WishItem(w.lamp_wish), 50_000).await;
    let detail = place(&w, w.alice, &checkout(&[item.id], None, false), NOW)
        .await
        .unwrap();
    let funding_id = detail.items[0].funding_id.unwrap();

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    funding::decide(&mut tx, funding_id, w.recipient, Decision::Accept, NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = orders::cancel(&mut tx, w.alice, detail.order.id, NOW)
        .await
        .unwrap_err();
    drop(tx);
    assert_eq!(err.code(), ErrorCode::Conflict);

    let mut conn = w.pool.acquire().await.unwrap();
    let order = orders::load(&mut conn, w.alice, detail.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(
        catalog::wish_item_status(&mut conn, w.lamp_wish).await.unwrap(),
        WishItemStatus::Funded
    );
    drop(conn);
    assert_eq!(w.balance(w.alice).await, 0);
}

#[tokio::test]
async fn confirmed_order_cannot_be_paid_again() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 50_000).await;
    let item = stage(&w, w.alice, CartTarget::WishItem(w.lamp_wish), 10_000).await;
    let detail = place(&w, w.alice, &checkout(&[item.id], None, false), NOW)
        .await
        .unwrap();

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let confirmed = orders::confirm(&mut tx, w.alice, detail.order.id, NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(confirmed.order.status, OrderStatus::Confirmed);
    assert!(confirmed.order.confirmed_at.is_some());

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = payments::pay_with_wallet(&mut tx, w.alice, detail.order.id, &Rules::default(), NOW)
        .await
        .unwrap_err();
    drop(tx);
    assert_eq!(err.code(), ErrorCode::Conflict);

    // Only the owner sees the order.
    let mut conn = w.pool.acquire().await.unwrap();
    let err = orders::load(&mut conn, w.bob, detail.order.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OrderNotFound);
}

// ─────────────────────────────────────────────────────────
// Card charges
// ─────────────────────────────────────────────────────────

async fn open_charge(w: &World, member: i64, amount: i64) -> Payment {
    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let p = payments::create_charge(&mut tx, member, amount, NOW).await.unwrap();
    tx.commit().await.unwrap();
    p
}

fn confirmation(p: &Payment, amount: i64) -> ChargeConfirmation {
    ChargeConfirmation {
        payment_id: p.id,
        payment_key: "pk_test_1".to_string(),
        order_id: p.gateway_order_id.clone().unwrap(),
        amount,
    }
}

async fn payment_status(w: &World, member: i64, id: i64) -> Payment {
    let mut conn = w.pool.acquire().await.unwrap();
    payments::load(&mut conn, member, id).await.unwrap()
}

#[tokio::test]
async fn confirmed_charge_credits_the_wallet() {
    let w = world(NOW).await;
    let gateway = MockGateway::approving();
    let charge = open_charge(&w, w.alice, 10_000).await;
    assert_eq!(charge.status, PaymentStatus::Pending);
    assert!(charge.gateway_order_id.as_deref().unwrap().starts_with("CHG-"));

    let paid = payments::confirm_charge(&w.pool, &gateway, w.alice, &confirmation(&charge, 10_000), NOW)
        .await
        .unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(paid.payment_key.as_deref(), Some("pk_test_1"));
    assert_eq!(w.balance(w.alice).await, 10_000);

    // A second confirm of the same charge is refused.
    let err = payments::confirm_charge(&w.pool, &gateway, w.alice, &confirmation(&charge, 10_000), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert_eq!(w.balance(w.alice).await, 10_000);
    w.assert_consistent().await;
}

#[tokio::test]
async fn amount_mismatch_fails_the_charge() {
    let w = world(NOW).await;
    let gateway = MockGateway::approving();
    let charge = open_charge(&w, w.alice, 10_000).await;

    let err = payments::confirm_charge(&w.pool, &gateway, w.alice, &confirmation(&charge, 9_000), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AmountMismatch);

    assert_eq!(w.balance(w.alice).await, 0);
    let p = payment_status(&w, w.alice, charge.id).await;
    assert_eq!(p.status, PaymentStatus::Failed);
    assert_eq!(p.failure_code.as_deref(), Some("AMOUNT_MISMATCH"));
}

#[tokio::test]
async fn gateway_rejection_is_recorded() {
    let w = world(NOW).await;
    let gateway = MockGateway::new(MockBehavior::Reject {
        code: "REJECT_CARD_COMPANY".to_string(),
        message: "declined".to_string(),
    });
    let charge = open_charge(&w, w.alice, 10_000).await;

    let err = payments::confirm_charge(&w.pool, &gateway, w.alice, &confirmation(&charge, 10_000), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChargeFailed);

    let p = payment_status(&w, w.alice, charge.id).await;
    assert_eq!(p.status, PaymentStatus::Failed);
    assert_eq!(p.failure_code.as_deref(), Some("REJECT_CARD_COMPANY"));
    assert_eq!(w.balance(w.alice).await, 0);

    // A different reported total is also a mismatch.
    gateway.set(MockBehavior::ReportAmount(9_000));
    let second = open_charge(&w, w.alice, 10_000).await;
    let err = payments::confirm_charge(&w.pool, &gateway, w.alice, &confirmation(&second, 10_000), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AmountMismatch);
    assert_eq!(w.balance(w.alice).await, 0);
}

#[tokio::test]
async fn foreign_or_mismatched_charges_are_refused() {
    let w = world(NOW).await;
    let gateway = MockGateway::approving();
    let charge = open_charge(&w, w.alice, 10_000).await;

    let err = payments::confirm_charge(&w.pool, &gateway, w.bob, &confirmation(&charge, 10_000), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PaymentNotFound);

    let mut wrong = confirmation(&charge, 10_000);
    wrong.order_id = "CHG-somebody-else".to_string();
    let err = payments::confirm_charge(&w.pool, &gateway, w.alice, &wrong, NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);

    // The charge is still open; the payer can report a redirect failure.
    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let failed = payments::fail_charge(&mut tx, w.alice, charge.id, "PAY_PROCESS_CANCELED", "closed", NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
}

// ─────────────────────────────────────────────────────────
// Expiry, decisions and events
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_expires_due_fundings_and_ends_cart_items() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 20_000).await;
    let f = w.open_funding(w.camera_wish, 100_000, 14).await;
    participate(&w, w.alice, f.id, 20_000).await.unwrap();
    let staged = stage(&w, w.bob, CartTarget::Funding(f.id), 10_000).await;
    assert_eq!(staged.status, CartItemStatus::Available);

    assert!(scheduler::sweep_once(&w.pool, NOW + DAY).await.unwrap().is_empty());
    let later = f.expires_at + 1;
    assert_eq!(scheduler::sweep_once(&w.pool, later).await.unwrap(), vec![f.id]);

    let expired = w.funding(f.id).await;
    assert_eq!(expired.status, FundingStatus::Expired);
    assert_eq!(expired.current_amount, 20_000);

    let mut conn = w.pool.acquire().await.unwrap();
    assert_eq!(
        catalog::wish_item_status(&mut conn, w.camera_wish).await.unwrap(),
        WishItemStatus::Available
    );
    let item = cart::load_item(&mut conn, w.bob, staged.id, later).await.unwrap();
    assert_eq!(item.status, CartItemStatus::FundingEnded);
    drop(conn);

    // Already expired: nothing left to sweep.
    assert!(scheduler::sweep_once(&w.pool, later + DAY).await.unwrap().is_empty());
    w.assert_consistent().await;
}

#[tokio::test]
async fn canceling_an_unpaid_order_releases_its_funding() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 5_000).await;
    let item = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 10_000).await;
    let detail = place(&w, w.alice, &checkout(&[item.id], None, true), NOW)
        .await
        .unwrap();
    let funding_id = detail.items[0].funding_id.unwrap();
    assert_eq!(w.funding(funding_id).await.status, FundingStatus::Pending);

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let canceled = orders::cancel(&mut tx, w.alice, detail.order.id, NOW + 60)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(canceled.order.status, OrderStatus::Canceled);
    assert_eq!(canceled.order.cancelled_at, Some(NOW + 60));
    assert!(canceled
        .items
        .iter()
        .all(|i| i.status == OrderItemStatus::Canceled));

    assert_eq!(w.funding(funding_id).await.status, FundingStatus::Expired);
    assert_eq!(w.balance(w.alice).await, 5_000);
    assert_eq!(w.count("payments").await, 0);

    let mut conn = w.pool.acquire().await.unwrap();
    assert_eq!(
        catalog::wish_item_status(&mut conn, w.camera_wish).await.unwrap(),
        WishItemStatus::Available
    );
    drop(conn);

    // The wish item is free for a new campaign right away.
    let fresh = w.open_funding(w.camera_wish, 100_000, 14).await;
    assert_eq!(fresh.status, FundingStatus::Pending);
    w.assert_consistent().await;
}

#[tokio::test]
async fn unpaid_order_on_a_shared_funding_leaves_it_open() {
    let w = world(NOW).await;
    let first = stage(&w, w.alice, CartTarget::WishItem(w.camera_wish), 10_000).await;
    let by_alice = place(&w, w.alice, &checkout(&[first.id], None, true), NOW)
        .await
        .unwrap();
    let funding_id = by_alice.items[0].funding_id.unwrap();

    let second = stage(&w, w.bob, CartTarget::Funding(funding_id), 10_000).await;
    place(&w, w.bob, &checkout(&[second.id], None, true), NOW)
        .await
        .unwrap();

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    orders::cancel(&mut tx, w.alice, by_alice.order.id, NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // Bob's unpaid line still needs it.
    assert_eq!(w.funding(funding_id).await.status, FundingStatus::Pending);
}

#[tokio::test]
async fn expiry_cancels_orders_that_can_no_longer_be_paid() {
    let w = world(NOW).await;
    let item = stage(&w, w.alice, CartTarget::WishItem(w.lamp_wish), 10_000).await;
    let detail = place(&w, w.alice, &checkout(&[item.id], None, true), NOW)
        .await
        .unwrap();
    let f = w.funding(detail.items[0].funding_id.unwrap()).await;

    let later = f.expires_at + 1;
    assert_eq!(scheduler::sweep_once(&w.pool, later).await.unwrap(), vec![f.id]);

    let mut conn = w.pool.acquire().await.unwrap();
    let order = orders::load(&mut conn, w.alice, detail.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Canceled);
    assert_eq!(
        catalog::wish_item_status(&mut conn, w.lamp_wish).await.unwrap(),
        WishItemStatus::Available
    );
    drop(conn);
    w.assert_consistent().await;
}

#[tokio::test]
async fn one_failing_funding_does_not_stop_the_sweep() {
    let w = world(NOW).await;
    let stuck = w.open_funding(w.camera_wish, 100_000, 1).await;
    let due = w.open_funding(w.lamp_wish, 50_000, 1).await;

    sqlx::query(&format!(
        "CREATE TRIGGER hold_funding BEFORE UPDATE OF status ON fundings \
         WHEN OLD.id = {} BEGIN SELECT RAISE(ABORT, 'held'); END",
        stuck.id
    ))
    .execute(&w.pool)
    .await
    .unwrap();

    let later = NOW + 2 * DAY;
    assert_eq!(scheduler::sweep_once(&w.pool, later).await.unwrap(), vec![due.id]);
    assert_eq!(w.funding(due.id).await.status, FundingStatus::Expired);
    assert_eq!(w.funding(stuck.id).await.status, FundingStatus::Pending);

    // Once the row can move again the next sweep picks it up.
    sqlx::query("DROP TRIGGER hold_funding")
        .execute(&w.pool)
        .await
        .unwrap();
    assert_eq!(scheduler::sweep_once(&w.pool, later).await.unwrap(), vec![stuck.id]);
}

#[tokio::test]
async fn only_the_recipient_decides() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 50_000).await;
    let f = w.open_funding(w.lamp_wish, 50_000, 14).await;

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = funding::decide(&mut tx, f.id, w.recipient, Decision::Accept, NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    drop(tx);

    participate(&w, w.alice, f.id, 50_000).await.unwrap();

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = funding::decide(&mut tx, f.id, w.alice, Decision::Accept, NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);
    drop(tx);

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let accepted = funding::decide(&mut tx, f.id, w.recipient, Decision::Accept, NOW)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(accepted.status, FundingStatus::Accepted);
    assert!(accepted.decided_at.is_some());

    // A funded wish item can no longer be staged.
    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = cart::add_item(
        &mut tx,
        w.bob,
        CartTarget::WishItem(w.lamp_wish),
        10_000,
        &Rules::default(),
        NOW,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
}

#[tokio::test]
async fn refusal_reaches_event_subscribers() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 50_000).await;
    let f = w.open_funding(w.lamp_wish, 50_000, 14).await;
    participate(&w, w.alice, f.id, 50_000).await.unwrap();

    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let cursor = relay::relay_once(&w.pool, &bus, 0).await.unwrap();
    while rx.try_recv().is_ok() {}

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let refused = funding::decide(
        &mut tx,
        f.id,
        w.recipient,
        Decision::Refuse {
            reason: Some("already have one".to_string()),
        },
        NOW,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(refused.status, FundingStatus::Refused);
    assert_eq!(refused.refuse_reason.as_deref(), Some("already have one"));

    relay::relay_once(&w.pool, &bus, cursor).await.unwrap();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind(), EventKind::FundingRefused);
    assert_eq!(event.entity_id, f.id);
    assert_eq!(event.member_id, Some(w.recipient));
    assert_eq!(event.amount, Some(50_000));
    assert!(rx.try_recv().is_err());

    let mut conn = w.pool.acquire().await.unwrap();
    assert_eq!(
        catalog::wish_item_status(&mut conn, w.lamp_wish).await.unwrap(),
        WishItemStatus::Available
    );
}

#[tokio::test]
async fn suspended_members_cannot_move_money() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 50_000).await;
    let f = w.open_funding(w.lamp_wish, 50_000, 14).await;

    let mut conn = w.pool.acquire().await.unwrap();
    catalog::set_member_status(&mut conn, w.alice, MemberStatus::Suspended)
        .await
        .unwrap();
    drop(conn);

    let err = participate(&w, w.alice, f.id, 10_000).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);
    assert_eq!(w.balance(w.alice).await, 50_000);
}

#[tokio::test]
async fn withdrawals_keep_the_ledger_consistent() {
    let w = world(NOW).await;
    w.fund_wallet(w.alice, 30_000).await;

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let entry = wallet::withdraw(&mut tx, w.alice, 12_000, NOW).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(entry.amount, -12_000);
    assert_eq!(entry.balance_after, 18_000);

    let mut tx = db::begin_write(&w.pool).await.unwrap();
    let err = wallet::withdraw(&mut tx, w.alice, 20_000, NOW).await.unwrap_err();
    drop(tx);
    assert_eq!(err.code(), ErrorCode::InsufficientBalance);

    assert_eq!(w.balance(w.alice).await, 18_000);
    w.assert_consistent().await;
}
