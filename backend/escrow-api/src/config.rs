//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{ApiError, Result};

/// What to do with the ledger when the asset transfer behind a payout fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPolicy {
    /// Keep the accounting and queue the transfer for retry.
    Reconcile,
    /// Reverse the payout so it can be claimed again.
    Rollback,
}

impl SettlementPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconcile => "reconcile",
            Self::Rollback => "rollback",
        }
    }
}

impl FromStr for SettlementPolicy {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reconcile" => Ok(Self::Reconcile),
            "rollback" => Ok(Self::Rollback),
            other => Err(ApiError::Config(format!(
                "Invalid SETTLEMENT_FAILURE_POLICY: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL or path
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Endpoint of the asset transfer service
    pub transfer_url: String,
    /// Account that holds escrowed funds and pays every transfer
    pub escrow_account: String,
    pub transfer_timeout_secs: u64,
    /// Attempts per transfer before it counts as failed
    pub transfer_max_attempts: u32,
    pub failure_policy: SettlementPolicy,
    /// How often (in seconds) queued transfers are retried
    pub reconcile_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ApiError::Config(format!("{key} environment variable is required")))
        };

        let transfer_max_attempts: u32 = var("TRANSFER_MAX_ATTEMPTS", "5")
            .parse()
            .map_err(|_| ApiError::Config("Invalid TRANSFER_MAX_ATTEMPTS".to_string()))?;
        if transfer_max_attempts == 0 {
            return Err(ApiError::Config(
                "TRANSFER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            database_url: var("DATABASE_URL", "sqlite:./escrow_ledger.db"),
            api_port: var("API_PORT", "3001")
                .parse()
                .map_err(|_| ApiError::Config("Invalid API_PORT".to_string()))?,
            transfer_url: required("TRANSFER_URL")?,
            escrow_account: required("ESCROW_ACCOUNT")?,
            transfer_timeout_secs: var("TRANSFER_TIMEOUT_SECS", "30")
                .parse()
                .map_err(|_| ApiError::Config("Invalid TRANSFER_TIMEOUT_SECS".to_string()))?,
            transfer_max_attempts,
            failure_policy: var("SETTLEMENT_FAILURE_POLICY", "reconcile").parse()?,
            reconcile_interval_secs: var("RECONCILE_INTERVAL_SECS", "60")
                .parse()
                .map_err(|_| ApiError::Config("Invalid RECONCILE_INTERVAL_SECS".to_string()))?,
        })
    }
}
