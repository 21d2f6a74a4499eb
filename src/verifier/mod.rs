//! Confirms that a claimed on-chain transaction exists, succeeded and paid
//! the expected recipient.

mod account;
mod object;

pub use account::{verify_account, AccountChainReader, AccountTransaction, EvmReader};
pub use object::{
    reconcile, BalanceChange, ExecutionStatus, LookupError, ObjectChainReader, ObjectChange,
    ObjectChangeKind, ObjectTransaction, SuiRpcReader, NATIVE_COIN_OBJECT_TYPE, NATIVE_COIN_TYPE,
};

use crate::{config::VerifierConfig, types::VerifyError};
use ethers::types::U256;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Chain {
    Evm(u64),
    Sui,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Evm(chain_id) => write!(f, "eip155:{chain_id}"),
            Chain::Sui => f.write_str("sui"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub chain: Chain,
    pub tx_hash: String,
    pub amount: U256,
    pub success: bool,
    /// Object-chain network the transaction was found on.
    pub network: Option<String>,
}

struct ObjectNetwork {
    name: String,
    reader: Arc<dyn ObjectChainReader>,
}

/// Holds no per-call state, so one instance serves concurrent verifications.
pub struct TransactionVerifier {
    config: VerifierConfig,
    evm: HashMap<u64, Arc<dyn AccountChainReader>>,
    networks: Vec<ObjectNetwork>,
}

impl TransactionVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            config,
            evm: HashMap::new(),
            networks: Vec::new(),
        }
    }

    pub fn with_evm_chain(mut self, chain_id: u64, reader: Arc<dyn AccountChainReader>) -> Self {
        self.evm.insert(chain_id, reader);
        self
    }

    /// Networks are consulted in the order they are added.
    pub fn with_object_network(
        mut self,
        name: impl Into<String>,
        reader: Arc<dyn ObjectChainReader>,
    ) -> Self {
        self.networks.push(ObjectNetwork {
            name: name.into(),
            reader,
        });
        self
    }

    pub async fn verify(
        &self,
        tx_hash: &str,
        chain: Chain,
        expected_recipient: &str,
    ) -> Result<VerifiedTransaction, VerifyError> {
        match chain {
            Chain::Evm(chain_id) => {
                let reader = self
                    .evm
                    .get(&chain_id)
                    .ok_or_else(|| VerifyError::UnsupportedChain(chain.to_string()))?;
                let (amount, success) =
                    verify_account(reader.as_ref(), tx_hash, expected_recipient).await?;
                info!(%chain, tx_hash, %amount, "transaction verified");
                Ok(VerifiedTransaction {
                    chain,
                    tx_hash: tx_hash.to_string(),
                    amount,
                    success,
                    network: None,
                })
            }
            Chain::Sui => self.verify_object(tx_hash, expected_recipient).await,
        }
    }

    async fn verify_object(
        &self,
        digest: &str,
        expected_recipient: &str,
    ) -> Result<VerifiedTransaction, VerifyError> {
        if self.networks.is_empty() {
            return Err(VerifyError::UnsupportedChain(Chain::Sui.to_string()));
        }
        for network in &self.networks {
            let Some(tx) = self.lookup(network, digest).await else {
                continue;
            };
            let amount = reconcile(network.reader.as_ref(), &tx, expected_recipient).await?;
            info!(network = %network.name, digest, %amount, "transaction verified");
            return Ok(VerifiedTransaction {
                chain: Chain::Sui,
                tx_hash: digest.to_string(),
                amount,
                success: true,
                network: Some(network.name.clone()),
            });
        }
        Err(VerifyError::NotFound(digest.to_string()))
    }

    /// Polls one network while the transaction is not indexed. Any other
    /// lookup error gives up on the network.
    async fn lookup(&self, network: &ObjectNetwork, digest: &str) -> Option<ObjectTransaction> {
        let attempts = self.config.retry_attempts.max(1);
        for attempt in 1..=attempts {
            match network.reader.transaction(digest).await {
                Ok(tx) => return Some(tx),
                Err(LookupError::NotIndexed) => {
                    debug!(network = %network.name, digest, attempt, "transaction not indexed yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
                Err(LookupError::Failed(reason)) => {
                    warn!(network = %network.name, digest, %reason, "lookup failed");
                    return None;
                }
            }
        }
        warn!(network = %network.name, digest, attempts, "transaction never indexed");
        None
    }
}
