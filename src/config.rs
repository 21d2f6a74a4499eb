//! Client and verifier configuration.

use crate::types::{rpc::Allowance, ClientError};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Longest lifetime a session key may be authorized for.
pub const MAX_SESSION_TTL_SECS: u64 = 3_600;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CHALLENGE_PERIOD_SECS: u64 = 86_400;
pub const DEFAULT_SCOPE: &str = "console";
pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 5;
pub const DEFAULT_VERIFY_DELAY_MS: u64 = 1_500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the broker.
    pub broker_url: String,
    /// Application name, also the EIP-712 domain name of the session policy.
    pub application: String,
    pub chain_id: u64,
    pub scope: String,
    pub session_ttl_secs: u64,
    /// Bound on a whole create-channel run and on each later broker request.
    pub request_timeout_secs: u64,
    /// Sandbox brokers take an allowance list with the auth request.
    pub sandbox: bool,
    pub allowances: Vec<Allowance>,
    /// Pin the settlement token instead of letting asset discovery choose.
    pub asset: Option<Address>,
    /// Shortest challenge period accepted in a broker-proposed channel.
    pub challenge_period_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:8000/ws".to_string(),
            application: "state-channel-client".to_string(),
            chain_id: 11_155_111,
            scope: DEFAULT_SCOPE.to_string(),
            session_ttl_secs: MAX_SESSION_TTL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            sandbox: false,
            allowances: Vec::new(),
            asset: None,
            challenge_period_secs: DEFAULT_CHALLENGE_PERIOD_SECS,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ClientError::InvalidState(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Session lifetime, never longer than an hour.
    pub fn session_ttl(&self) -> u64 {
        self.session_ttl_secs.min(MAX_SESSION_TTL_SECS)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Allowances actually sent; only sandbox brokers accept them.
    pub fn requested_allowances(&self) -> Vec<Allowance> {
        if self.sandbox {
            self.allowances.clone()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Lookups per object-chain network while the transaction is not indexed.
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            retry_attempts: DEFAULT_VERIFY_ATTEMPTS,
            retry_delay_ms: DEFAULT_VERIFY_DELAY_MS,
        }
    }
}

impl VerifierConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
