//! Card payment gateway client.
//!
//! The gateway runs its own checkout UI; the browser comes back with a
//! `paymentKey` and we finalize the charge server-side with a confirm call.
//!
//! ## Resilience
//!
//! * Transport errors, 429 and 5xx responses are retried with exponential
//!   back-off, doubling from [`Backoff::initial`] up to [`Backoff::max`], for
//!   at most [`Backoff::attempts`] tries.
//! * Any other 4xx is a hard rejection and carries the gateway's
//!   `{code, message}` body.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{AppError, Result};

/// Body of the confirm call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub payment_key: String,
    pub order_id: String,
    pub amount: i64,
}

/// What the gateway reports for a confirmed charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReceipt {
    pub payment_key: String,
    pub order_id: String,
    pub total_amount: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub approved_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct GatewayFailure {
    code: String,
    message: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway refused the charge.
    #[error("gateway rejected the charge ({code}): {message}")]
    Rejected { code: String, message: String },

    /// Retries exhausted on transport errors or 429/5xx.
    #[error("gateway unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },

    #[error("unreadable gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Code recorded on the failed payment.
    pub fn code(&self) -> &str {
        match self {
            Self::Rejected { code, .. } => code,
            Self::Unavailable { .. } => "GATEWAY_UNAVAILABLE",
            Self::Decode(_) => "GATEWAY_BAD_RESPONSE",
        }
    }

    /// Message shown to the payer.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected { code, message } => gateway_message(code)
                .map(str::to_string)
                .unwrap_or_else(|| message.clone()),
            Self::Unavailable { .. } | Self::Decode(_) => {
                "The payment service is temporarily unavailable. Please try again.".to_string()
            }
        }
    }
}

/// Known gateway rejection codes and how we phrase them.
const GATEWAY_MESSAGES: &[(&str, &str)] = &[
    ("PAY_PROCESS_CANCELED", "The payment was canceled."),
    ("PAY_PROCESS_ABORTED", "The payment was interrupted. Please try again."),
    ("REJECT_CARD_COMPANY", "Your card company declined the payment."),
    ("INVALID_CARD_EXPIRATION", "Your card has expired or the expiry date is wrong."),
    ("INVALID_STOPPED_CARD", "This card has been suspended."),
    ("EXCEED_MAX_DAILY_PAYMENT_COUNT", "Daily payment limit reached for this card."),
    ("EXCEED_MAX_AMOUNT", "The amount exceeds this card's limit."),
    ("NOT_ENOUGH_BALANCE", "Insufficient funds on the card."),
    ("NOT_FOUND_PAYMENT_SESSION", "The payment session expired. Please start again."),
    ("ALREADY_PROCESSED_PAYMENT", "This payment was already processed."),
];

pub fn gateway_message(code: &str) -> Option<&'static str> {
    GATEWAY_MESSAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, m)| *m)
}

/// Finalizes card charges.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest) -> std::result::Result<GatewayReceipt, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            attempts: 4,
        }
    }
}

/// Gateway reached over HTTP with Basic auth (`secret_key:` base64-encoded).
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    authorization: String,
    backoff: Backoff,
}

impl HttpGateway {
    pub fn new(base_url: &str, secret_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: format!("Basic {}", STANDARD.encode(format!("{secret_key}:"))),
            backoff: Backoff::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn confirm_url(&self) -> String {
        format!("{}/v1/payments/confirm", self.base_url)
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn confirm(&self, request: &ConfirmRequest) -> std::result::Result<GatewayReceipt, GatewayError> {
        let mut delay = self.backoff.initial;
        let mut last = String::new();

        for attempt in 1..=self.backoff.attempts {
            let response = self
                .client
                .post(self.confirm_url())
                .header(reqwest::header::AUTHORIZATION, &self.authorization)
                // The order id doubles as the idempotency key so a retried
                // confirm never charges twice.
                .header("Idempotency-Key", &request.order_id)
                .json(request)
                .send()
                .await;

            match response {
                Err(e) => {
                    last = e.to_string();
                    warn!("Gateway request failed (attempt {attempt}): {e}");
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let receipt = resp
                            .json::<GatewayReceipt>()
                            .await
                            .map_err(|e| GatewayError::Decode(e.to_string()))?;
                        debug!("Gateway confirmed {} for {}", receipt.total_amount, receipt.order_id);
                        return Ok(receipt);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last = format!("HTTP {status}");
                        warn!("Gateway answered {status} (attempt {attempt})");
                    } else {
                        let failure = resp
                            .json::<GatewayFailure>()
                            .await
                            .map_err(|e| GatewayError::Decode(e.to_string()))?;
                        return Err(GatewayError::Rejected {
                            code: failure.code,
                            message: failure.message,
                        });
                    }
                }
            }

            if attempt < self.backoff.attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.backoff.max);
            }
        }

        Err(GatewayError::Unavailable {
            attempts: self.backoff.attempts,
            last,
        })
    }
}

/// Scripted outcome of [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Approve,
    Reject { code: String, message: String },
    /// Approve, but report a different total than requested.
    ReportAmount(i64),
}

/// In-process gateway for development and tests.
#[derive(Debug)]
pub struct MockGateway {
    behavior: Mutex<MockBehavior>,
}

impl MockGateway {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
        }
    }

    pub fn approving() -> Self {
        Self::new(MockBehavior::Approve)
    }

    pub fn set(&self, behavior: MockBehavior) {
        if let Ok(mut current) = self.behavior.lock() {
            *current = behavior;
        }
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior
            .lock()
            .map(|b| b.clone())
            .unwrap_or(MockBehavior::Approve)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn confirm(&self, request: &ConfirmRequest) -> std::result::Result<GatewayReceipt, GatewayError> {
        let total_amount = match self.behavior() {
            MockBehavior::Approve => request.amount,
            MockBehavior::ReportAmount(amount) => amount,
            MockBehavior::Reject { code, message } => {
                return Err(GatewayError::Rejected { code, message })
            }
        };
        Ok(GatewayReceipt {
            payment_key: request.payment_key.clone(),
            order_id: request.order_id.clone(),
            total_amount,
            status: "DONE".to_string(),
            approved_at: Some(chrono::Utc::now().to_rfc3339()),
        })
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::Domain(giftfund_core::DomainError::ChargeFailed {
            code: err.code().to_string(),
            message: err.user_message(),
        })
    }
}
