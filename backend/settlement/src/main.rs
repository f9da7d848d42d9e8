//! GiftFund settlement service: entry point.
//!
//! Starts the funding expiry scheduler and the outbox relay as background
//! tasks, then serves the REST API until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use settlement::auth::TrustedProxyIdentity;
use settlement::config::{Config, GatewayMode};
use settlement::events::EventBus;
use settlement::gateway::{HttpGateway, MockGateway, PaymentGateway};
use settlement::{db, relay, scheduler, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    let pool = db::init_pool(&config.database_url).await?;

    let gateway: Arc<dyn PaymentGateway> = match config.gateway_mode {
        GatewayMode::Http => {
            let secret = config
                .gateway_secret_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("GATEWAY_SECRET_KEY is not set"))?;
            info!("Card gateway: {}", config.gateway_base_url);
            Arc::new(HttpGateway::new(
                &config.gateway_base_url,
                secret,
                Duration::from_secs(config.gateway_timeout_secs),
            )?)
        }
        GatewayMode::Mock => {
            warn!("Card gateway is mocked; every charge will be approved");
            Arc::new(MockGateway::approving())
        }
    };

    let bus = EventBus::default();
    let shutdown = CancellationToken::new();

    // ─── Background tasks ─────────────────────────────────
    let sweeper = tokio::spawn(scheduler::run(
        pool.clone(),
        Duration::from_secs(config.expiry_sweep_interval_secs),
        shutdown.clone(),
    ));
    let relayer = tokio::spawn(relay::run(
        pool.clone(),
        bus.clone(),
        Duration::from_secs(config.event_relay_interval_secs),
        shutdown.clone(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let state = Arc::new(AppState {
        pool,
        rules: config.rules,
        gateway,
        identity: Arc::new(TrustedProxyIdentity),
        bus,
    });
    let app = settlement::router(state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(sweeper, relayer);
    Ok(())
}
