//! Client for a state-channel broker plus an on-chain payment verifier.
//!
//! [`ChannelClient`] authenticates against a broker over WebSocket with a
//! short-lived session key, opens and funds channels, moves value inside
//! them and closes them cooperatively. [`TransactionVerifier`] checks that
//! a claimed transfer really landed on an EVM chain or on Sui.

pub mod assets;
pub mod auth;
pub mod client;
pub mod config;
pub mod settlement;
pub mod state;
pub mod transport;
pub mod types;
pub mod utils;
pub mod verifier;

pub use auth::{Eip712Signer, RequestSigner, SessionKey, SessionSigner};
pub use client::{ChannelClient, CloseOutcome, CreatedChannel, FundedChannel};
pub use config::{ClientConfig, VerifierConfig};
pub use settlement::{ChainSettlement, CustodySettlement, OpenChannel};
pub use state::{ClientRegistry, SettlementStatus};
pub use transport::{Connector, WsConnector};
pub use types::{Allocation, Asset, Channel, ChannelState, ClientError, Intent, VerifyError};
pub use verifier::{Chain, TransactionVerifier, VerifiedTransaction};
