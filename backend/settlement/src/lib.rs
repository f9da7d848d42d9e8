//! GiftFund settlement service.
//!
//! Cart → order → payment → wallet settlement and funding contribution
//! accounting behind a REST API. The binary (`main.rs`) wires configuration,
//! background tasks and the HTTP server; everything else lives here so the
//! integration tests can drive the same router and pipeline.

pub mod api;
pub mod auth;
pub mod cart;
pub mod catalog;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod funding;
pub mod gateway;
pub mod models;
pub mod orders;
pub mod payments;
pub mod relay;
pub mod scheduler;
pub mod wallet;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use auth::IdentityProvider;
use config::Rules;
use events::EventBus;
use gateway::PaymentGateway;

/// Shared handler state.
pub struct AppState {
    pub pool: SqlitePool,
    pub rules: Rules,
    pub gateway: Arc<dyn PaymentGateway>,
    pub identity: Arc<dyn IdentityProvider>,
    pub bus: EventBus,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/carts/items",
            get(api::list_cart)
                .post(api::add_cart_item)
                .delete(api::clear_cart),
        )
        .route(
            "/carts/items/:id",
            axum::routing::patch(api::update_cart_item).delete(api::remove_cart_item),
        )
        .route("/orders", get(api::list_orders).post(api::create_order))
        .route("/orders/:id", get(api::get_order))
        .route("/orders/:id/pay", post(api::pay_order))
        .route("/orders/:id/confirm", post(api::confirm_order))
        .route("/orders/:id/cancel", post(api::cancel_order))
        .route("/payments/charge", post(api::create_charge))
        .route("/payments/confirm", post(api::confirm_charge))
        .route("/payments/:id/fail", post(api::fail_charge))
        .route("/fundings/:id", get(api::get_funding))
        .route("/fundings/:id/participate", post(api::participate))
        .route("/fundings/:id/accept", post(api::accept_funding))
        .route("/fundings/:id/refuse", post(api::refuse_funding))
        .route("/fundings/:id/events", get(api::funding_events))
        .route("/events", get(api::event_feed))
        .route("/wallet/balance", get(api::wallet_balance))
        .route("/wallet/history", get(api::wallet_history))
        .route("/wallet/withdraw", post(api::withdraw))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
