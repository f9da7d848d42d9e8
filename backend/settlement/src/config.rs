//! Application configuration loaded from environment variables.

use giftfund_core::funding::{DEFAULT_DURATION_DAYS, DEFAULT_MIN_CONTRIBUTION};

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// In-process gateway that approves every confirmation.
    Mock,
    /// Real card gateway over HTTP.
    Http,
}

/// Business knobs consumed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rules {
    /// Smallest accepted contribution, in won.
    pub min_contribution: i64,
    /// Lifetime of a newly materialized funding.
    pub funding_duration_days: i64,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            min_contribution: DEFAULT_MIN_CONTRIBUTION,
            funding_duration_days: DEFAULT_DURATION_DAYS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    pub rules: Rules,
    /// How often (in seconds) to sweep for expired fundings
    pub expiry_sweep_interval_secs: u64,
    /// How often (in seconds) to relay new domain events to subscribers
    pub event_relay_interval_secs: u64,
    pub gateway_mode: GatewayMode,
    /// Card gateway API root (e.g. https://api.tosspayments.com)
    pub gateway_base_url: String,
    /// Card gateway secret key; required in `http` mode
    pub gateway_secret_key: Option<String>,
    pub gateway_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let gateway_mode = match env_var("GATEWAY_MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .as_str()
        {
            "mock" => GatewayMode::Mock,
            "http" => GatewayMode::Http,
            other => {
                return Err(AppError::Config(format!(
                    "Invalid GATEWAY_MODE {other:?} (expected mock or http)"
                )))
            }
        };
        let gateway_secret_key = env_var("GATEWAY_SECRET_KEY").ok();
        if gateway_mode == GatewayMode::Http && gateway_secret_key.is_none() {
            return Err(AppError::Config(
                "GATEWAY_SECRET_KEY environment variable is required in http mode".to_string(),
            ));
        }

        let rules = Rules {
            min_contribution: parse_or("MIN_CONTRIBUTION", DEFAULT_MIN_CONTRIBUTION)?,
            funding_duration_days: parse_or("FUNDING_DURATION_DAYS", DEFAULT_DURATION_DAYS)?,
        };
        if rules.min_contribution <= 0 {
            return Err(AppError::Config("MIN_CONTRIBUTION must be positive".to_string()));
        }
        if rules.funding_duration_days <= 0 {
            return Err(AppError::Config(
                "FUNDING_DURATION_DAYS must be positive".to_string(),
            ));
        }

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./giftfund.db".to_string()),
            api_port: parse_or("API_PORT", 3001)?,
            rules,
            expiry_sweep_interval_secs: parse_or("EXPIRY_SWEEP_INTERVAL_SECS", 60)?,
            event_relay_interval_secs: parse_or("EVENT_RELAY_INTERVAL_SECS", 2)?,
            gateway_mode,
            gateway_base_url: env_var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.tosspayments.com".to_string()),
            gateway_secret_key,
            gateway_timeout_secs: parse_or("GATEWAY_TIMEOUT_SECS", 30)?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
