//! Account-model chains: the transaction itself names recipient and value.

use crate::{types::VerifyError, utils::crypto::same_address};
use async_trait::async_trait;
use ethers::{
    providers::Middleware,
    types::{Address, H256, U256},
};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountTransaction {
    pub hash: H256,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub value: U256,
    /// Receipt status once mined: `Some(true)` success, `Some(false)` reverted.
    pub status: Option<bool>,
}

#[async_trait]
pub trait AccountChainReader: Send + Sync {
    async fn transaction(&self, hash: H256) -> Result<Option<AccountTransaction>, VerifyError>;
}

/// Reads through any ethers middleware (`Provider<Http>`, `Provider<Ws>`, ...).
pub struct EvmReader<M> {
    client: Arc<M>,
}

impl<M: Middleware> EvmReader<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M> AccountChainReader for EvmReader<M>
where
    M: Middleware + 'static,
{
    async fn transaction(&self, hash: H256) -> Result<Option<AccountTransaction>, VerifyError> {
        let Some(tx) = self
            .client
            .get_transaction(hash)
            .await
            .map_err(|e| VerifyError::Rpc(e.to_string()))?
        else {
            return Ok(None);
        };
        let receipt = self
            .client
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| VerifyError::Rpc(e.to_string()))?;
        Ok(Some(AccountTransaction {
            hash,
            to: tx.to,
            value: tx.value,
            status: receipt.and_then(|r| r.status).map(|s| s.as_u64() == 1),
        }))
    }
}

/// Single lookup, no retry. Returns the transferred value and whether the
/// transaction is mined successfully.
pub async fn verify_account(
    reader: &dyn AccountChainReader,
    tx_hash: &str,
    expected_recipient: &str,
) -> Result<(U256, bool), VerifyError> {
    let hash: H256 = tx_hash
        .trim()
        .parse()
        .map_err(|_| VerifyError::NotFound(tx_hash.to_string()))?;
    let tx = reader
        .transaction(hash)
        .await?
        .ok_or_else(|| VerifyError::NotFound(tx_hash.to_string()))?;

    if tx.status == Some(false) {
        return Err(VerifyError::ChainExecutionFailed(format!(
            "transaction {tx_hash} reverted"
        )));
    }

    let actual = tx.to.map(|to| format!("{to:?}"));
    match &actual {
        Some(to) if same_address(to, expected_recipient) => Ok((tx.value, tx.status == Some(true))),
        _ => Err(VerifyError::RecipientMismatch {
            expected: expected_recipient.to_string(),
            actual,
        }),
    }
}
