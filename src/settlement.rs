//! On-chain side of channel creation and funding.

use crate::{
    types::{Channel, ChannelState, ClientError},
    utils::crypto::{channel_token, state_token},
};
use async_trait::async_trait;
use ethers::{
    abi::{decode, encode, ParamType, Token},
    providers::Middleware,
    types::{transaction::eip2718::TypedTransaction, Address, Bytes, TransactionRequest, H256, U256},
    utils::id,
};
use std::sync::Arc;
use tracing::{debug, info};

const DEPOSIT_AND_CREATE: &str = "depositAndCreate(address,uint256,(address[],address,uint64,uint64),(uint8,uint256,bytes,(address,address,uint256)[],bytes[]))";
const DEPOSIT: &str = "deposit(address,address,uint256)";
const APPROVE: &str = "approve(address,uint256)";
const ALLOWANCE: &str = "allowance(address,address)";

/// Everything the custody contract needs to open a funded channel.
#[derive(Clone, Debug)]
pub struct OpenChannel {
    pub token: Address,
    pub amount: U256,
    pub channel: Channel,
    pub initial_state: ChannelState,
    /// Owner signature first, broker co-signature second.
    pub signatures: Vec<Vec<u8>>,
}

#[async_trait]
pub trait ChainSettlement: Send + Sync {
    /// Deposits and registers the channel in one transaction.
    async fn deposit_and_create(&self, open: &OpenChannel) -> Result<H256, ClientError>;

    /// Tops up the owner's custody balance ahead of a resize.
    async fn deposit(&self, token: Address, amount: U256) -> Result<H256, ClientError>;
}

fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(args));
    Bytes::from(data)
}

/// Custody contract reached through any ethers middleware able to send
/// transactions, typically a `SignerMiddleware` over the owner's wallet.
pub struct CustodySettlement<M> {
    client: Arc<M>,
    custody: Address,
}

impl<M: Middleware> CustodySettlement<M> {
    pub fn new(client: Arc<M>, custody: Address) -> Self {
        Self { client, custody }
    }

    fn sender(&self) -> Result<Address, ClientError> {
        self.client
            .default_sender()
            .ok_or_else(|| ClientError::Settlement("middleware has no default sender".to_string()))
    }

    async fn allowance(&self, token: Address, owner: Address) -> Result<U256, ClientError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(token)
            .data(calldata(
                ALLOWANCE,
                &[Token::Address(owner), Token::Address(self.custody)],
            ))
            .into();
        let raw = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| ClientError::Settlement(e.to_string()))?;
        let decoded = decode(&[ParamType::Uint(256)], &raw)
            .map_err(|e| ClientError::Settlement(e.to_string()))?;
        Ok(decoded
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .unwrap_or_default())
    }

    async fn submit(&self, tx: TransactionRequest) -> Result<H256, ClientError> {
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| ClientError::Settlement(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    /// Approves the custody contract for `amount` of an ERC-20 token when the
    /// current allowance is short, waiting for the approval to be mined.
    async fn ensure_allowance(&self, token: Address, amount: U256) -> Result<(), ClientError> {
        if token.is_zero() {
            return Ok(());
        }
        let owner = self.sender()?;
        let current = self.allowance(token, owner).await?;
        if current >= amount {
            return Ok(());
        }
        debug!(?token, %current, %amount, "approving custody contract");
        let tx = TransactionRequest::new()
            .from(owner)
            .to(token)
            .data(calldata(
                APPROVE,
                &[Token::Address(self.custody), Token::Uint(amount)],
            ));
        let receipt = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| ClientError::Settlement(e.to_string()))?
            .await
            .map_err(|e| ClientError::Settlement(e.to_string()))?;
        match receipt.and_then(|r| r.status) {
            Some(status) if status.as_u64() == 1 => Ok(()),
            _ => Err(ClientError::Settlement("token approval failed".to_string())),
        }
    }

    /// Native deposits carry the amount as value; token deposits carry none.
    fn value_for(token: Address, amount: U256) -> U256 {
        if token.is_zero() {
            amount
        } else {
            U256::zero()
        }
    }
}

#[async_trait]
impl<M> ChainSettlement for CustodySettlement<M>
where
    M: Middleware + 'static,
{
    async fn deposit_and_create(&self, open: &OpenChannel) -> Result<H256, ClientError> {
        self.ensure_allowance(open.token, open.amount).await?;
        let tx = TransactionRequest::new()
            .from(self.sender()?)
            .to(self.custody)
            .value(Self::value_for(open.token, open.amount))
            .data(calldata(
                DEPOSIT_AND_CREATE,
                &[
                    Token::Address(open.token),
                    Token::Uint(open.amount),
                    channel_token(&open.channel),
                    state_token(&open.initial_state, &open.signatures),
                ],
            ));
        let hash = self.submit(tx).await?;
        info!(tx = ?hash, channel = ?open.channel.id(), "deposit-and-create submitted");
        Ok(hash)
    }

    async fn deposit(&self, token: Address, amount: U256) -> Result<H256, ClientError> {
        self.ensure_allowance(token, amount).await?;
        let owner = self.sender()?;
        let tx = TransactionRequest::new()
            .from(owner)
            .to(self.custody)
            .value(Self::value_for(token, amount))
            .data(calldata(
                DEPOSIT,
                &[Token::Address(owner), Token::Address(token), Token::Uint(amount)],
            ));
        let hash = self.submit(tx).await?;
        info!(tx = ?hash, ?token, %amount, "custody deposit submitted");
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calldata_starts_with_selector() {
        let data = calldata(
            APPROVE,
            &[Token::Address(Address::repeat_byte(1)), Token::Uint(U256::one())],
        );
        // approve(address,uint256)
        assert_eq!(&data[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(data.len(), 4 + 64);
    }

    #[test]
    fn only_native_deposits_carry_value() {
        let amount = U256::from(10u64);
        assert_eq!(
            CustodySettlement::<ethers::providers::Provider<ethers::providers::Http>>::value_for(
                Address::zero(),
                amount
            ),
            amount
        );
        assert!(
            CustodySettlement::<ethers::providers::Provider<ethers::providers::Http>>::value_for(
                Address::repeat_byte(1),
                amount
            )
            .is_zero()
        );
    }
}
