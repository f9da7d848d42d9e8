//! HTTP-level tests through the Axum router.

mod common;

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{world, World};
use serde_json::{json, Value};
use settlement::auth::TrustedProxyIdentity;
use settlement::config::Rules;
use settlement::events::EventBus;
use settlement::gateway::MockGateway;
use settlement::{db, AppState};
use tower::ServiceExt;

fn app(w: &World, gateway: Arc<MockGateway>) -> Router {
    let state = Arc::new(AppState {
        pool: w.pool.clone(),
        rules: Rules::default(),
        gateway,
        identity: Arc::new(TrustedProxyIdentity),
        bus: EventBus::default(),
    });
    settlement::router(state)
}

async fn setup() -> (World, Router) {
    let w = world(db::now()).await;
    let router = app(&w, Arc::new(MockGateway::approving()));
    (w, router)
}

/// Send one request as `member` (anonymous when `None`) and decode the body.
async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    member: Option<i64>,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    if let Some(member) = member {
        request = request
            .header("Authorization", "Bearer test-token")
            .header("X-Member-Id", member.to_string());
    }
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    let body = match body {
        Some(json_body) => Body::from(serde_json::to_vec(&json_body).unwrap()),
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    member: i64,
    body: Option<Value>,
) -> (StatusCode, Value) {
    send(router, method, uri, Some(member), &[], body).await
}

#[tokio::test]
async fn health_needs_no_credentials() {
    let (_w, router) = setup().await;
    let (status, body) = send(&router, "GET", "/health", None, &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn missing_credentials_are_rejected() {
    let (w, router) = setup().await;

    let (status, body) = send(&router, "GET", "/carts/items", None, &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_REQUIRED");
    assert!(body["message"].is_string());

    // A member header without a bearer token is not enough.
    let member = w.alice.to_string();
    let (status, _) = send(
        &router,
        "GET",
        "/wallet/balance",
        None,
        &[("X-Member-Id", member.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn cart_round_trip() {
    let (w, router) = setup().await;

    let (status, item) = call(
        &router,
        "POST",
        "/carts/items",
        w.alice,
        Some(json!({ "wishItemId": w.camera_wish, "amount": 10_000 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(item["targetType"], "FUNDING_PENDING");
    assert_eq!(item["status"], "AVAILABLE");
    let item_id = item["id"].as_i64().unwrap();

    let (status, _) = call(
        &router,
        "PATCH",
        &format!("/carts/items/{item_id}"),
        w.alice,
        Some(json!({ "selected": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, view) = call(&router, "GET", "/carts/items", w.alice, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["items"].as_array().unwrap().len(), 1);
    assert_eq!(view["summary"]["selectedCount"], 0);
    assert_eq!(view["summary"]["selectedTotal"], 0);

    // Another member cannot touch it.
    let (status, body) = call(
        &router,
        "DELETE",
        &format!("/carts/items/{item_id}"),
        w.bob,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CART_ITEM_NOT_FOUND");

    let (status, _) = call(
        &router,
        "DELETE",
        &format!("/carts/items/{item_id}"),
        w.alice,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let (w, router) = setup().await;

    let (status, body) = call(
        &router,
        "POST",
        "/carts/items",
        w.alice,
        Some(json!({ "fundingId": 1, "wishItemId": w.camera_wish, "amount": 10_000 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = call(
        &router,
        "POST",
        "/orders",
        w.alice,
        Some(json!({ "cartItemIds": "not a list" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = call(
        &router,
        "GET",
        "/wallet/history?type=BONUS",
        w.alice,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn order_with_idempotency_key_is_created_once() {
    let (w, router) = setup().await;
    w.fund_wallet(w.alice, 50_000).await;

    let (_, item) = call(
        &router,
        "POST",
        "/carts/items",
        w.alice,
        Some(json!({ "wishItemId": w.lamp_wish, "amount": 20_000 })),
    )
    .await;
    let body = json!({ "cartItemIds": [item["id"]] });

    let headers = [("Idempotency-Key", "checkout-42")];
    let (status, first) = send(
        &router,
        "POST",
        "/orders",
        Some(w.alice),
        &headers,
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "PAID");
    assert_eq!(first["items"][0]["orderItemType"], "FUNDING_GIFT");

    let (status, again) = send(&router, "POST", "/orders", Some(w.alice), &headers, Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(again["id"], first["id"]);

    let (_, listing) = call(&router, "GET", "/orders", w.alice, None).await;
    assert_eq!(listing["orders"].as_array().unwrap().len(), 1);

    let funding_id = first["items"][0]["fundingId"].as_i64().unwrap();
    let (status, funding) = call(&router, "GET", &format!("/fundings/{funding_id}"), w.bob, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(funding["funding"]["currentAmount"], 20_000);
    assert_eq!(funding["participants"][0]["memberId"], w.alice);

    let (_, wallet) = call(&router, "GET", "/wallet/balance", w.alice, None).await;
    assert_eq!(wallet["balance"], 30_000);
    let (_, history) = call(&router, "GET", "/wallet/history?type=PAYMENT", w.alice, None).await;
    assert_eq!(history["items"][0]["amount"], -20_000);
}

#[tokio::test]
async fn short_wallet_is_reported_with_details() {
    let (w, router) = setup().await;
    w.fund_wallet(w.alice, 5_000).await;

    let (_, item) = call(
        &router,
        "POST",
        "/carts/items",
        w.alice,
        Some(json!({ "wishItemId": w.lamp_wish, "amount": 10_000 })),
    )
    .await;
    let (status, body) = call(
        &router,
        "POST",
        "/orders",
        w.alice,
        Some(json!({ "cartItemIds": [item["id"]] })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INSUFFICIENT_BALANCE");
    assert_eq!(body["details"]["balance"], 5_000);

    // The cart item survived the failed checkout.
    let (_, view) = call(&router, "GET", "/carts/items", w.alice, None).await;
    assert_eq!(view["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn card_charge_confirmation() {
    let (w, router) = setup().await;

    let (status, charge) = call(
        &router,
        "POST",
        "/payments/charge",
        w.alice,
        Some(json!({ "amount": 10_000 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(charge["status"], "PENDING");

    let (status, body) = call(
        &router,
        "POST",
        "/payments/charge",
        w.alice,
        Some(json!({ "amount": 9_000_000_000_000_000_000i64 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, body) = call(
        &router,
        "POST",
        "/payments/confirm",
        w.alice,
        Some(json!({
            "paymentId": charge["paymentId"],
            "paymentKey": "pk_1",
            "orderId": charge["orderId"],
            "amount": 9_000,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["errorCode"], "AMOUNT_MISMATCH");
    assert_eq!(body["code"], "AMOUNT_MISMATCH");

    let (_, second) = call(
        &router,
        "POST",
        "/payments/charge",
        w.alice,
        Some(json!({ "amount": 10_000 })),
    )
    .await;
    let (status, body) = call(
        &router,
        "POST",
        "/payments/confirm",
        w.alice,
        Some(json!({
            "paymentId": second["paymentId"],
            "paymentKey": "pk_2",
            "orderId": second["orderId"],
            "amount": 10_000,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["amount"], 10_000);

    let (_, wallet) = call(&router, "GET", "/wallet/balance", w.alice, None).await;
    assert_eq!(wallet["balance"], 10_000);
}

#[tokio::test]
async fn only_the_recipient_may_decide() {
    let (w, router) = setup().await;
    w.fund_wallet(w.alice, 50_000).await;

    let (_, item) = call(
        &router,
        "POST",
        "/carts/items",
        w.alice,
        Some(json!({ "wishItemId": w.lamp_wish, "amount": 50_000 })),
    )
    .await;
    let (_, order) = call(
        &router,
        "POST",
        "/orders",
        w.alice,
        Some(json!({ "cartItemIds": [item["id"]] })),
    )
    .await;
    let funding_id = order["items"][0]["fundingId"].as_i64().unwrap();

    let (status, body) = call(
        &router,
        "POST",
        &format!("/fundings/{funding_id}/refuse"),
        w.alice,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    // A body that is present but unreadable is rejected, not ignored.
    let (status, body) = call(
        &router,
        "POST",
        &format!("/fundings/{funding_id}/refuse"),
        w.recipient,
        Some(json!({ "reason": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, funding) = call(
        &router,
        "POST",
        &format!("/fundings/{funding_id}/refuse"),
        w.recipient,
        Some(json!({ "reason": "too big" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(funding["status"], "REFUSED");
    assert_eq!(funding["refuseReason"], "too big");

    let (_, events) = call(
        &router,
        "GET",
        &format!("/fundings/{funding_id}/events"),
        w.recipient,
        None,
    )
    .await;
    let kinds: Vec<&str> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["eventType"].as_str())
        .collect();
    assert_eq!(
        kinds,
        ["funding_created", "funding_participated", "funding_achieved", "funding_refused"]
    );
}
