//! Request signers.
//!
//! Two strategies share [`RequestSigner`]: [`SessionSigner`] holds a
//! throwaway key and signs the keccak digest of routine request bytes,
//! [`Eip712Signer`] wraps the owner's wallet and signs typed, domain-scoped
//! structures. Callers pick the signer per message; neither inspects payloads
//! to decide.

use crate::{
    types::{rpc::Allowance, ClientError},
    utils::{crypto::payload_digest, Clock},
};
use async_trait::async_trait;
use ethers::{
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip712::{Eip712, TypedData},
        Address, RecoveryMessage, Signature, H256,
    },
};
use serde_json::json;
use std::sync::Arc;

pub enum SignPayload<'a> {
    /// Raw bytes. Session keys sign their keccak digest, the owner signs an
    /// EIP-191 personal message.
    Bytes(&'a [u8]),
    /// Session authorization policy, EIP-712 typed.
    Policy(&'a Policy),
}

#[async_trait]
pub trait RequestSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, payload: SignPayload<'_>) -> Result<Signature, ClientError>;
}

/// What the owner authorizes a session key to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub application: String,
    pub challenge: String,
    pub scope: String,
    pub wallet: Address,
    pub session_key: Address,
    pub expires_at: u64,
    pub allowances: Vec<Allowance>,
}

impl Policy {
    /// EIP-712 document for this policy. The domain carries the application
    /// name so a signature for one application is useless for another.
    pub fn typed_data(&self) -> Result<TypedData, ClientError> {
        let document = json!({
            "types": {
                "EIP712Domain": [
                    { "name": "name", "type": "string" }
                ],
                "Policy": [
                    { "name": "challenge", "type": "string" },
                    { "name": "scope", "type": "string" },
                    { "name": "wallet", "type": "address" },
                    { "name": "session_key", "type": "address" },
                    { "name": "expires_at", "type": "uint64" },
                    { "name": "allowances", "type": "Allowance[]" }
                ],
                "Allowance": [
                    { "name": "asset", "type": "string" },
                    { "name": "amount", "type": "string" }
                ]
            },
            "primaryType": "Policy",
            "domain": { "name": self.application },
            "message": {
                "challenge": self.challenge,
                "scope": self.scope,
                "wallet": format!("{:?}", self.wallet),
                "session_key": format!("{:?}", self.session_key),
                "expires_at": self.expires_at,
                "allowances": self.allowances,
            }
        });
        Ok(serde_json::from_value(document)?)
    }

    pub fn digest(&self) -> Result<H256, ClientError> {
        let hash = self
            .typed_data()?
            .encode_eip712()
            .map_err(|e| ClientError::SigningRejected(e.to_string()))?;
        Ok(H256::from(hash))
    }

    /// Address that produced `signature` over this policy.
    pub fn recover(&self, signature: &Signature) -> Result<Address, ClientError> {
        signature
            .recover(RecoveryMessage::Hash(self.digest()?))
            .map_err(|e| ClientError::AuthenticationFailed(e.to_string()))
    }
}

/// Ephemeral key authorized to sign routine traffic until `expires_at`.
#[derive(Clone, Debug)]
pub struct SessionKey {
    wallet: LocalWallet,
    expires_at: u64,
}

impl SessionKey {
    pub fn generate(expires_at: u64) -> Self {
        Self::from_wallet(LocalWallet::new(&mut rand::thread_rng()), expires_at)
    }

    pub fn from_wallet(wallet: LocalWallet, expires_at: u64) -> Self {
        Self { wallet, expires_at }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    fn sign_at(&self, payload: &[u8], now: u64) -> Result<Signature, ClientError> {
        if self.is_expired(now) {
            return Err(ClientError::SessionExpired);
        }
        self.wallet
            .sign_hash(payload_digest(payload))
            .map_err(|e| ClientError::SigningRejected(e.to_string()))
    }

    /// Checks a session signature as the broker would: the key must not have
    /// expired at `now` and the signature must recover to this key.
    pub fn verify(&self, payload: &[u8], signature: &Signature, now: u64) -> Result<(), ClientError> {
        if self.is_expired(now) {
            return Err(ClientError::SessionExpired);
        }
        let recovered = signature
            .recover(RecoveryMessage::Hash(payload_digest(payload)))
            .map_err(|e| ClientError::AuthenticationFailed(e.to_string()))?;
        if recovered != self.address() {
            return Err(ClientError::AuthenticationFailed(format!(
                "signature from {recovered:?}, expected session key {:?}",
                self.address()
            )));
        }
        Ok(())
    }
}

pub struct SessionSigner {
    key: SessionKey,
    clock: Arc<dyn Clock>,
}

impl SessionSigner {
    pub fn new(key: SessionKey, clock: Arc<dyn Clock>) -> Self {
        Self { key, clock }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

#[async_trait]
impl RequestSigner for SessionSigner {
    fn address(&self) -> Address {
        self.key.address()
    }

    async fn sign(&self, payload: SignPayload<'_>) -> Result<Signature, ClientError> {
        match payload {
            SignPayload::Bytes(bytes) => self.key.sign_at(bytes, self.clock.now()),
            SignPayload::Policy(_) => Err(ClientError::SigningRejected(
                "session keys cannot authorize policies".to_string(),
            )),
        }
    }
}

/// Owner wallet signer. Any ethers signer works: a local key, a hardware
/// wallet, or a remote signer that may refuse the prompt.
pub struct Eip712Signer<S> {
    inner: S,
}

impl<S: Signer> Eip712Signer<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> RequestSigner for Eip712Signer<S>
where
    S: Signer + Send + Sync,
{
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn sign(&self, payload: SignPayload<'_>) -> Result<Signature, ClientError> {
        match payload {
            SignPayload::Policy(policy) => {
                let typed = policy.typed_data()?;
                self.inner
                    .sign_typed_data(&typed)
                    .await
                    .map_err(|e| ClientError::SigningRejected(e.to_string()))
            }
            SignPayload::Bytes(bytes) => self
                .inner
                .sign_message(bytes)
                .await
                .map_err(|e| ClientError::SigningRejected(e.to_string())),
        }
    }
}
