//! Typed client for the settlement API.
//!
//! Besides one method per endpoint this module carries the client-side
//! state the checkout pages need:
//!
//! * [`CartSession`] applies cart mutations optimistically and restores the
//!   exact previous snapshot when the server rejects them.
//! * [`ChargeSession`] holds the pending payment id between opening a card
//!   charge and its confirm callback, and clears it on every outcome.

use std::time::Duration;

use giftfund_core::messages::{self, DEFAULT_MESSAGE, NETWORK_MESSAGE};
use giftfund_core::notify::{CachedView, InvalidationSubscriber};
use giftfund_core::{
    CartItem, CartSummary, ErrorBody, ErrorCode, Funding, FundingParticipant, Optimistic,
    Reconciled, TransactionType, Wallet, WalletTransaction,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{
    ChargeResponse, ClearCartResponse, ConfirmChargeResponse, FundingResponse, HistoryResponse,
    OrdersResponse, PayOrderResponse, IDEMPOTENCY_HEADER,
};
use crate::auth::MEMBER_HEADER;
use crate::cart::{CartPatch, CartTarget, CartView};
use crate::orders::OrderDetail;

#[derive(Debug, Error)]
pub enum ClientError {
    /// No response reached us.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a structured error.
    #[error("{} ({status}): {}", .body.code, .body.message)]
    Api { status: u16, body: ErrorBody },

    #[error("unreadable response: {0}")]
    Decode(String),

    #[error("no card charge is in progress")]
    NoPendingPayment,
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api { body, .. } => body.error_code(),
            _ => None,
        }
    }

    /// Text to show in the transient notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => NETWORK_MESSAGE.to_string(),
            Self::Api { body, .. } => messages::render(body),
            Self::Decode(_) | Self::NoPendingPayment => DEFAULT_MESSAGE.to_string(),
        }
    }

    /// Network failures and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { body, .. } => body.error_code().is_some_and(|c| c.is_retryable()),
            _ => false,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Authenticated handle on the API for one member.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: String,
    member_id: i64,
}

impl ApiClient {
    pub fn new(base_url: &str, token: &str, member_id: i64) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            member_id,
        })
    }

    pub fn member_id(&self) -> i64 {
        self.member_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
            .header(MEMBER_HEADER, self.member_id.to_string())
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ClientResult<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()));
        }
        let body: ErrorBody =
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))?;
        debug!("API answered {status}: {} {}", body.code, body.message);
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ClientResult<()> {
        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .json::<ErrorBody>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn cart(&self) -> ClientResult<CartView> {
        self.send(self.request(Method::GET, "/carts/items")).await
    }

    pub async fn add_to_cart(&self, target: CartTarget, amount: i64) -> ClientResult<CartItem> {
        let body = match target {
            CartTarget::Funding(id) => json!({ "fundingId": id, "amount": amount }),
            CartTarget::WishItem(id) => json!({ "wishItemId": id, "amount": amount }),
        };
        self.send(self.request(Method::POST, "/carts/items").json(&body))
            .await
    }

    pub async fn update_cart_item(&self, item_id: i64, patch: CartPatch) -> ClientResult<CartItem> {
        let body = json!({ "amount": patch.amount, "selected": patch.selected });
        self.send(
            self.request(Method::PATCH, &format!("/carts/items/{item_id}"))
                .json(&body),
        )
        .await
    }

    pub async fn remove_cart_item(&self, item_id: i64) -> ClientResult<()> {
        self.send_empty(self.request(Method::DELETE, &format!("/carts/items/{item_id}")))
            .await
    }

    pub async fn clear_cart(&self) -> ClientResult<u64> {
        let resp: ClearCartResponse = self
            .send(self.request(Method::DELETE, "/carts/items"))
            .await?;
        Ok(resp.removed)
    }

    pub async fn create_order(
        &self,
        cart_item_ids: &[i64],
        idempotency_key: Option<&str>,
        defer_payment: bool,
    ) -> ClientResult<OrderDetail> {
        let mut builder = self.request(Method::POST, "/orders").json(&json!({
            "cartItemIds": cart_item_ids,
            "paymentMethod": "WALLET",
            "deferPayment": defer_payment,
        }));
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        self.send(builder).await
    }

    pub async fn orders(&self, page: i64, size: i64) -> ClientResult<OrdersResponse> {
        self.send(
            self.request(Method::GET, "/orders")
                .query(&[("page", page), ("size", size)]),
        )
        .await
    }

    pub async fn order(&self, order_id: i64) -> ClientResult<OrderDetail> {
        self.send(self.request(Method::GET, &format!("/orders/{order_id}")))
            .await
    }

    pub async fn pay_order(&self, order_id: i64) -> ClientResult<PayOrderResponse> {
        self.send(self.request(Method::POST, &format!("/orders/{order_id}/pay")))
            .await
    }

    pub async fn confirm_order(&self, order_id: i64) -> ClientResult<OrderDetail> {
        self.send(self.request(Method::POST, &format!("/orders/{order_id}/confirm")))
            .await
    }

    pub async fn cancel_order(&self, order_id: i64) -> ClientResult<OrderDetail> {
        self.send(self.request(Method::POST, &format!("/orders/{order_id}/cancel")))
            .await
    }

    pub async fn create_charge(&self, amount: i64) -> ClientResult<ChargeResponse> {
        self.send(
            self.request(Method::POST, "/payments/charge")
                .json(&json!({ "amount": amount })),
        )
        .await
    }

    pub async fn confirm_charge(
        &self,
        payment_id: i64,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> ClientResult<ConfirmChargeResponse> {
        self.send(self.request(Method::POST, "/payments/confirm").json(&json!({
            "paymentId": payment_id,
            "paymentKey": payment_key,
            "orderId": order_id,
            "amount": amount,
        })))
        .await
    }

    pub async fn fail_charge(&self, payment_id: i64, code: &str, message: &str) -> ClientResult<()> {
        self.send_empty(
            self.request(Method::POST, &format!("/payments/{payment_id}/fail"))
                .json(&json!({ "code": code, "message": message })),
        )
        .await
    }

    pub async fn funding(&self, funding_id: i64) -> ClientResult<FundingResponse> {
        self.send(self.request(Method::GET, &format!("/fundings/{funding_id}")))
            .await
    }

    pub async fn participate(&self, funding_id: i64, amount: i64) -> ClientResult<FundingParticipant> {
        self.send(
            self.request(Method::POST, &format!("/fundings/{funding_id}/participate"))
                .json(&json!({ "amount": amount })),
        )
        .await
    }

    pub async fn accept_funding(&self, funding_id: i64) -> ClientResult<Funding> {
        self.send(self.request(Method::POST, &format!("/fundings/{funding_id}/accept")))
            .await
    }

    pub async fn refuse_funding(&self, funding_id: i64, reason: Option<&str>) -> ClientResult<Funding> {
        self.send(
            self.request(Method::POST, &format!("/fundings/{funding_id}/refuse"))
                .json(&json!({ "reason": reason })),
        )
        .await
    }

    pub async fn balance(&self) -> ClientResult<Wallet> {
        self.send(self.request(Method::GET, "/wallet/balance")).await
    }

    pub async fn history(
        &self,
        tx_type: Option<TransactionType>,
        page: i64,
        size: i64,
    ) -> ClientResult<Vec<WalletTransaction>> {
        let mut query = vec![("page", page.to_string()), ("size", size.to_string())];
        if let Some(t) = tx_type {
            query.push(("type", t.as_str().to_string()));
        }
        let resp: HistoryResponse = self
            .send(self.request(Method::GET, "/wallet/history").query(&query))
            .await?;
        Ok(resp.items)
    }

    pub async fn withdraw(&self, amount: i64) -> ClientResult<WalletTransaction> {
        self.send(
            self.request(Method::POST, "/wallet/withdraw")
                .json(&json!({ "amount": amount })),
        )
        .await
    }
}

// ─────────────────────────────────────────────────────────
// Cart session
// ─────────────────────────────────────────────────────────

/// Locally held cart with optimistic mutations.
#[derive(Debug, Default)]
pub struct CartSession {
    view: CartView,
    stale: bool,
    notices: Vec<String>,
}

fn patch_view(view: &mut CartView, item_id: i64, patch: CartPatch) {
    if let Some(item) = view.items.iter_mut().find(|i| i.id == item_id) {
        if let Some(amount) = patch.amount {
            item.amount = amount;
        }
        if let Some(selected) = patch.selected {
            item.selected = selected;
        }
    }
    view.summary = CartSummary::of(&view.items);
}

impl CartSession {
    pub fn view(&self) -> &CartView {
        &self.view
    }

    /// Set when an event said the cart changed elsewhere.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Messages for rejected mutations, oldest first. Draining clears them.
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    pub async fn refresh(&mut self, client: &ApiClient) -> ClientResult<&CartView> {
        self.view = client.cart().await?;
        self.stale = false;
        Ok(&self.view)
    }

    fn settle(&mut self, outcome: Reconciled<CartView, ClientError>) -> Reconciled<CartView, ClientError> {
        if let Some(err) = outcome.error() {
            warn!("Cart change rolled back: {err}");
            self.notices.push(err.user_message());
        }
        self.view = outcome.state().clone();
        outcome
    }

    /// Change amount and/or selection of one item.
    pub async fn update(
        &mut self,
        client: &ApiClient,
        item_id: i64,
        patch: CartPatch,
    ) -> Reconciled<CartView, ClientError> {
        let pending = Optimistic::apply(&self.view, |v| patch_view(v, item_id, patch));
        self.view = pending.projected().clone();

        let mut authoritative = pending.projected().clone();
        let outcome = client.update_cart_item(item_id, patch).await.map(|item| {
            if let Some(slot) = authoritative.items.iter_mut().find(|i| i.id == item.id) {
                *slot = item;
            }
            authoritative.summary = CartSummary::of(&authoritative.items);
            authoritative
        });
        let reconciled = pending.reconcile(outcome);
        self.settle(reconciled)
    }

    pub async fn toggle(
        &mut self,
        client: &ApiClient,
        item_id: i64,
        selected: bool,
    ) -> Reconciled<CartView, ClientError> {
        let patch = CartPatch {
            amount: None,
            selected: Some(selected),
        };
        self.update(client, item_id, patch).await
    }

    pub async fn remove(&mut self, client: &ApiClient, item_id: i64) -> Reconciled<CartView, ClientError> {
        let pending = Optimistic::apply(&self.view, |v| {
            v.items.retain(|i| i.id != item_id);
            v.summary = CartSummary::of(&v.items);
        });
        self.view = pending.projected().clone();

        let projected = pending.projected().clone();
        let outcome = client.remove_cart_item(item_id).await.map(|()| projected);
        let reconciled = pending.reconcile(outcome);
        self.settle(reconciled)
    }
}

impl InvalidationSubscriber for CartSession {
    fn invalidate(&mut self, view: CachedView) {
        if view == CachedView::Cart {
            self.stale = true;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Card charge
// ─────────────────────────────────────────────────────────

/// Holds the payment id of an in-flight card charge.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChargeSession {
    pending_payment_id: Option<i64>,
}

impl ChargeSession {
    pub fn pending(&self) -> Option<i64> {
        self.pending_payment_id
    }

    /// Open a charge and remember it until the gateway sends the payer back.
    pub async fn start(&mut self, client: &ApiClient, amount: i64) -> ClientResult<ChargeResponse> {
        let charge = client.create_charge(amount).await?;
        self.pending_payment_id = Some(charge.payment_id);
        Ok(charge)
    }

    /// Success redirect from the gateway. The marker is cleared whatever
    /// the outcome.
    pub async fn complete(
        &mut self,
        client: &ApiClient,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> ClientResult<ConfirmChargeResponse> {
        let payment_id = self
            .pending_payment_id
            .take()
            .ok_or(ClientError::NoPendingPayment)?;
        client
            .confirm_charge(payment_id, payment_key, order_id, amount)
            .await
    }

    /// Failure redirect from the gateway.
    pub async fn abort(&mut self, client: &ApiClient, code: &str, message: &str) -> ClientResult<()> {
        let payment_id = self
            .pending_payment_id
            .take()
            .ok_or(ClientError::NoPendingPayment)?;
        client.fail_charge(payment_id, code, message).await
    }
}
