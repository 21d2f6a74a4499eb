use ethers::types::H256;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Signature request rejected: {0}")]
    SigningRejected(String),
    #[error("Broker error: {0}")]
    Protocol(String),
    #[error("{operation} timed out after {bound:?}")]
    Timeout {
        operation: &'static str,
        bound: Duration,
    },
    #[error("Connection error: {0}")]
    Transport(String),
    #[error("Session key expired")]
    SessionExpired,
    #[error("Invalid channel state: {0}")]
    InvalidState(String),
    #[error("Unknown channel {0:?}")]
    UnknownChannel(H256),
    #[error("On-chain settlement failed: {0}")]
    Settlement(String),
    /// Custody deposit went through but the broker never resized the channel.
    #[error("Deposit {deposit_tx:?} submitted but resize failed: {source}")]
    FundingIncomplete {
        deposit_tx: H256,
        #[source]
        source: Box<ClientError>,
    },
    #[error("Malformed payload: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ClientError {
    pub(crate) fn connection_closed() -> Self {
        ClientError::Transport("connection closed".to_string())
    }

    /// Errors after which the broker connection can no longer be used.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Protocol(_)
                | ClientError::Transport(_)
                | ClientError::AuthenticationFailed(_)
                | ClientError::Timeout { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Transaction {0} not found")]
    NotFound(String),
    #[error("Recipient mismatch: expected {expected}, found {}", actual.as_deref().unwrap_or("no transfer"))]
    RecipientMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("Transaction execution failed: {0}")]
    ChainExecutionFailed(String),
    #[error("No reader configured for {0}")]
    UnsupportedChain(String),
    #[error("Chain RPC error: {0}")]
    Rpc(String),
}
