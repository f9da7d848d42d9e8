//! Axum REST API handlers.
//!
//! Every mutating handler opens one transaction, runs one pipeline
//! operation against it and commits. Errors drop the transaction, which
//! rolls back everything the operation wrote.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use giftfund_core::funding::Decision;
use giftfund_core::{
    CartItem, DomainError, ErrorBody, ErrorCode, Funding, FundingParticipant, Order, Payment,
    PaymentMethod, PaymentStatus, TransactionType, Wallet, WalletTransaction,
};
use serde::{Deserialize, Serialize};

use crate::auth::AuthMember;
use crate::cart::{self, CartPatch, CartTarget, CartView};
use crate::db::{self, Page};
use crate::errors::{AppError, Result};
use crate::events::{self, EventRecord};
use crate::orders::{self, NewOrder, OrderDetail};
use crate::payments::{self, ChargeConfirmation};
use crate::{funding, wallet, AppState};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;
type QueryParams<T> = std::result::Result<Query<T>, QueryRejection>;

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCartItemRequest {
    pub funding_id: Option<i64>,
    pub wish_item_id: Option<i64>,
    pub amount: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCartItemRequest {
    pub amount: Option<i64>,
    pub selected: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCartResponse {
    pub removed: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub cart_item_ids: Vec<i64>,
    #[serde(default = "wallet_method")]
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub defer_payment: bool,
}

fn wallet_method() -> PaymentMethod {
    PaymentMethod::Wallet
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersResponse {
    pub page: i64,
    pub size: i64,
    pub orders: Vec<Order>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayOrderResponse {
    pub order: Order,
    pub payment: Payment,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResponse {
    pub payment_id: i64,
    /// Order id to hand to the gateway checkout.
    pub order_id: String,
    pub amount: i64,
    pub status: PaymentStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmChargeRequest {
    pub payment_id: i64,
    pub payment_key: String,
    pub order_id: String,
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmChargeResponse {
    pub success: bool,
    pub payment_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConfirmChargeResponse {
    /// The error code of a failed confirmation, if it is a known one.
    pub fn error(&self) -> Option<ErrorCode> {
        self.error_code.as_deref().and_then(ErrorCode::from_code)
    }
}

#[derive(Debug, Deserialize)]
pub struct FailChargeRequest {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingResponse {
    pub funding: Funding,
    pub participants: Vec<FundingParticipant>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefuseRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventsResponse {
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventFeedQuery {
    pub after: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(rename = "type")]
    pub tx_type: Option<String>,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub page: i64,
    pub size: i64,
    pub items: Vec<WalletTransaction>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /carts/items`
pub async fn list_cart(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
) -> Result<Json<CartView>> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(cart::list_items(&mut conn, member, db::now()).await?))
}

/// `POST /carts/items`
pub async fn add_cart_item(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    body: JsonBody<AddCartItemRequest>,
) -> Result<(StatusCode, Json<CartItem>)> {
    let Json(req) = body?;
    let target = CartTarget::from_ids(req.funding_id, req.wish_item_id)?;

    let mut tx = db::begin_write(&state.pool).await?;
    let item = cart::add_item(&mut tx, member, target, req.amount, &state.rules, db::now()).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// `PATCH /carts/items/:id`
pub async fn update_cart_item(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(item_id): Path<i64>,
    body: JsonBody<UpdateCartItemRequest>,
) -> Result<Json<CartItem>> {
    let Json(req) = body?;
    let patch = CartPatch {
        amount: req.amount,
        selected: req.selected,
    };

    let mut tx = db::begin_write(&state.pool).await?;
    let item = cart::update_item(&mut tx, member, item_id, patch, &state.rules, db::now()).await?;
    tx.commit().await?;
    Ok(Json(item))
}

/// `DELETE /carts/items/:id`
pub async fn remove_cart_item(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(item_id): Path<i64>,
) -> Result<StatusCode> {
    let mut tx = db::begin_write(&state.pool).await?;
    cart::remove_item(&mut tx, member, item_id).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /carts/items`
pub async fn clear_cart(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
) -> Result<Json<ClearCartResponse>> {
    let mut tx = db::begin_write(&state.pool).await?;
    let removed = cart::clear(&mut tx, member).await?;
    tx.commit().await?;
    Ok(Json(ClearCartResponse { removed }))
}

/// `POST /orders`
///
/// Honors an optional `Idempotency-Key` header.
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    headers: HeaderMap,
    body: JsonBody<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderDetail>)> {
    let Json(req) = body?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .map(|v| {
            v.to_str()
                .map(|s| s.trim().to_string())
                .map_err(|_| DomainError::Validation("malformed Idempotency-Key".to_string()))
        })
        .transpose()?
        .filter(|k| !k.is_empty());

    let request = NewOrder {
        cart_item_ids: req.cart_item_ids,
        payment_method: req.payment_method,
        defer_payment: req.defer_payment,
        idempotency_key,
    };

    let mut tx = db::begin_write(&state.pool).await?;
    let order = orders::create_order(&mut tx, member, &request, &state.rules, db::now()).await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// `GET /orders`
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    query: QueryParams<PageQuery>,
) -> Result<Json<OrdersResponse>> {
    let Query(q) = query?;
    let page = Page::new(q.page, q.size);
    let mut conn = state.pool.acquire().await?;
    let orders = orders::list(&mut conn, member, page).await?;
    Ok(Json(OrdersResponse {
        page: page.page,
        size: page.size,
        orders,
    }))
}

/// `GET /orders/:id`
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderDetail>> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(orders::detail(&mut conn, member, order_id).await?))
}

/// `POST /orders/:id/pay`
pub async fn pay_order(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(order_id): Path<i64>,
) -> Result<Json<PayOrderResponse>> {
    let now = db::now();
    let mut tx = db::begin_write(&state.pool).await?;
    let payment = payments::pay_with_wallet(&mut tx, member, order_id, &state.rules, now).await?;
    let order = orders::load(&mut tx, member, order_id).await?;
    tx.commit().await?;
    Ok(Json(PayOrderResponse { order, payment }))
}

/// `POST /orders/:id/confirm`
pub async fn confirm_order(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderDetail>> {
    let mut tx = db::begin_write(&state.pool).await?;
    let order = orders::confirm(&mut tx, member, order_id, db::now()).await?;
    tx.commit().await?;
    Ok(Json(order))
}

/// `POST /orders/:id/cancel`
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderDetail>> {
    let mut tx = db::begin_write(&state.pool).await?;
    let order = orders::cancel(&mut tx, member, order_id, db::now()).await?;
    tx.commit().await?;
    Ok(Json(order))
}

/// `POST /payments/charge`
pub async fn create_charge(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    body: JsonBody<AmountRequest>,
) -> Result<(StatusCode, Json<ChargeResponse>)> {
    let Json(req) = body?;
    let mut tx = db::begin_write(&state.pool).await?;
    let payment = payments::create_charge(&mut tx, member, req.amount, db::now()).await?;
    tx.commit().await?;

    Ok((
        StatusCode::CREATED,
        Json(ChargeResponse {
            payment_id: payment.id,
            order_id: payment.gateway_order_id.unwrap_or_default(),
            amount: payment.origin_amount,
            status: payment.status,
        }),
    ))
}

/// Failure body of `POST /payments/confirm`: the standard error fields plus
/// the `success` / `errorCode` / `errorMessage` trio the checkout page reads.
#[derive(Debug, Serialize)]
struct ConfirmFailure {
    #[serde(flatten)]
    outcome: ConfirmChargeResponse,
    #[serde(flatten)]
    error: ErrorBody,
}

/// `POST /payments/confirm`
pub async fn confirm_charge(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    body: JsonBody<ConfirmChargeRequest>,
) -> Result<Response> {
    let Json(req) = body?;
    let confirmation = ChargeConfirmation {
        payment_id: req.payment_id,
        payment_key: req.payment_key,
        order_id: req.order_id,
        amount: req.amount,
    };

    match payments::confirm_charge(
        &state.pool,
        state.gateway.as_ref(),
        member,
        &confirmation,
        db::now(),
    )
    .await
    {
        Ok(payment) => Ok(Json(ConfirmChargeResponse {
            success: true,
            payment_id: payment.id,
            amount: Some(payment.paid_amount),
            error_code: None,
            error_message: None,
        })
        .into_response()),
        Err(err @ AppError::Domain(DomainError::ChargeFailed { .. }))
        | Err(err @ AppError::Domain(DomainError::AmountMismatch { .. })) => {
            let error = err.to_body();
            let message = match &err {
                AppError::Domain(DomainError::ChargeFailed { message, .. }) => message.clone(),
                _ => error.message.clone(),
            };
            let failure = ConfirmFailure {
                outcome: ConfirmChargeResponse {
                    success: false,
                    payment_id: confirmation.payment_id,
                    amount: None,
                    error_code: Some(error.code.clone()),
                    error_message: Some(message),
                },
                error,
            };
            Ok((err.status_code(), Json(failure)).into_response())
        }
        Err(other) => Err(other),
    }
}

/// `POST /payments/:id/fail`
pub async fn fail_charge(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(payment_id): Path<i64>,
    body: JsonBody<FailChargeRequest>,
) -> Result<Json<Payment>> {
    let Json(req) = body?;
    let mut tx = db::begin_write(&state.pool).await?;
    let payment =
        payments::fail_charge(&mut tx, member, payment_id, &req.code, &req.message, db::now())
            .await?;
    tx.commit().await?;
    Ok(Json(payment))
}

/// `GET /fundings/:id`
pub async fn get_funding(
    State(state): State<Arc<AppState>>,
    AuthMember(_member): AuthMember,
    Path(funding_id): Path<i64>,
) -> Result<Json<FundingResponse>> {
    let mut conn = state.pool.acquire().await?;
    let funding = funding::load(&mut conn, funding_id).await?;
    let participants = funding::participants(&mut conn, funding_id).await?;
    Ok(Json(FundingResponse {
        funding,
        participants,
    }))
}

/// `POST /fundings/:id/participate`
pub async fn participate(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(funding_id): Path<i64>,
    body: JsonBody<AmountRequest>,
) -> Result<Json<FundingParticipant>> {
    let Json(req) = body?;
    let mut tx = db::begin_write(&state.pool).await?;
    let participant =
        payments::participate(&mut tx, member, funding_id, req.amount, &state.rules, db::now())
            .await?;
    tx.commit().await?;
    Ok(Json(participant))
}

/// `POST /fundings/:id/accept`
pub async fn accept_funding(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(funding_id): Path<i64>,
) -> Result<Json<Funding>> {
    let mut tx = db::begin_write(&state.pool).await?;
    let funding = funding::decide(&mut tx, funding_id, member, Decision::Accept, db::now()).await?;
    tx.commit().await?;
    Ok(Json(funding))
}

/// `POST /fundings/:id/refuse`
///
/// The body may be empty; otherwise it must be `{"reason": "..."}`.
pub async fn refuse_funding(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    Path(funding_id): Path<i64>,
    body: Bytes,
) -> Result<Json<Funding>> {
    let reason = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<RefuseRequest>(&body)
            .map_err(|e| DomainError::Validation(format!("malformed refusal: {e}")))?
            .reason
    };
    let mut tx = db::begin_write(&state.pool).await?;
    let funding = funding::decide(
        &mut tx,
        funding_id,
        member,
        Decision::Refuse { reason },
        db::now(),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(funding))
}

/// `GET /fundings/:id/events`
pub async fn funding_events(
    State(state): State<Arc<AppState>>,
    AuthMember(_member): AuthMember,
    Path(funding_id): Path<i64>,
) -> Result<Json<EventsResponse>> {
    let mut conn = state.pool.acquire().await?;
    funding::load(&mut conn, funding_id).await?;
    let events = events::for_entity(&mut conn, "funding", funding_id).await?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /events?after=&limit=`
///
/// Polling feed of committed domain events, oldest first.
pub async fn event_feed(
    State(state): State<Arc<AppState>>,
    AuthMember(_member): AuthMember,
    query: QueryParams<EventFeedQuery>,
) -> Result<Json<EventsResponse>> {
    let Query(q) = query?;
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    let mut conn = state.pool.acquire().await?;
    let events = events::since(&mut conn, q.after.unwrap_or(0), limit).await?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /wallet/balance`
pub async fn wallet_balance(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
) -> Result<Json<Wallet>> {
    let mut conn = state.pool.acquire().await?;
    Ok(Json(wallet::load(&mut conn, member).await?))
}

/// `GET /wallet/history?type=&page=&size=`
pub async fn wallet_history(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    query: QueryParams<HistoryQuery>,
) -> Result<Json<HistoryResponse>> {
    let Query(q) = query?;
    let tx_type = q
        .tx_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<TransactionType>()
                .map_err(|e| DomainError::Validation(e.to_string()))
        })
        .transpose()?;
    let page = Page::new(q.page, q.size);

    let mut conn = state.pool.acquire().await?;
    wallet::load(&mut conn, member).await?;
    let items = wallet::history(&mut conn, member, tx_type, page).await?;
    Ok(Json(HistoryResponse {
        page: page.page,
        size: page.size,
        items,
    }))
}

/// `POST /wallet/withdraw`
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    AuthMember(member): AuthMember,
    body: JsonBody<AmountRequest>,
) -> Result<Json<WalletTransaction>> {
    let Json(req) = body?;
    let mut tx = db::begin_write(&state.pool).await?;
    crate::catalog::require_active(&mut tx, member).await?;
    let entry = wallet::withdraw(&mut tx, member, req.amount, db::now()).await?;
    tx.commit().await?;
    Ok(Json(entry))
}
