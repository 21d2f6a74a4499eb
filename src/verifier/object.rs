//! Object-model chains (Sui): value moves as balance changes or coin objects,
//! and freshly submitted transactions take a while to be indexed.

use crate::{
    types::VerifyError,
    utils::crypto::{normalize_type_tag, same_address},
};
use async_trait::async_trait;
use ethers::types::U256;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const NATIVE_COIN_TYPE: &str = "0x2::sui::SUI";
pub const NATIVE_COIN_OBJECT_TYPE: &str = "0x2::coin::Coin<0x2::sui::SUI>";

const NOT_INDEXED: &str = "Could not find the referenced transaction";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceChange {
    /// Address owner, `None` for shared or immutable owners.
    pub owner: Option<String>,
    pub coin_type: String,
    pub amount: i128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectChangeKind {
    Created,
    Transferred,
    Mutated,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectChange {
    pub kind: ObjectChangeKind,
    pub object_id: String,
    pub object_type: Option<String>,
    /// Receiving address: the recipient of a transfer or the owner of a
    /// created object.
    pub receiver: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectTransaction {
    pub digest: String,
    pub status: ExecutionStatus,
    pub balance_changes: Vec<BalanceChange>,
    pub object_changes: Vec<ObjectChange>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// The node does not know the transaction (yet).
    NotIndexed,
    Failed(String),
}

#[async_trait]
pub trait ObjectChainReader: Send + Sync {
    async fn transaction(&self, digest: &str) -> Result<ObjectTransaction, LookupError>;

    /// Balance of a coin object, `None` if the object does not exist.
    async fn coin_balance(&self, object_id: &str) -> Result<Option<U256>, LookupError>;
}

impl ObjectTransaction {
    /// Native coin the receiver gained according to the balance changes.
    pub fn received_balance(&self, receiver: &str) -> U256 {
        let native = normalize_type_tag(NATIVE_COIN_TYPE);
        self.balance_changes
            .iter()
            .filter(|c| c.amount > 0)
            .filter(|c| normalize_type_tag(&c.coin_type) == native)
            .filter(|c| c.owner.as_deref().is_some_and(|o| same_address(o, receiver)))
            .fold(U256::zero(), |acc, c| acc + U256::from(c.amount as u128))
    }

    /// Native coin objects created for or transferred to the receiver.
    pub fn received_coins(&self, receiver: &str) -> Vec<&str> {
        let coin = normalize_type_tag(NATIVE_COIN_OBJECT_TYPE);
        self.object_changes
            .iter()
            .filter(|c| matches!(c.kind, ObjectChangeKind::Created | ObjectChangeKind::Transferred))
            .filter(|c| {
                c.object_type
                    .as_deref()
                    .is_some_and(|t| normalize_type_tag(t) == coin)
            })
            .filter(|c| c.receiver.as_deref().is_some_and(|r| same_address(r, receiver)))
            .map(|c| c.object_id.as_str())
            .collect()
    }
}

/// Amount delivered to `receiver`: balance changes first, coin objects as a
/// fallback. Zero from both is a recipient mismatch.
pub async fn reconcile(
    reader: &dyn ObjectChainReader,
    tx: &ObjectTransaction,
    receiver: &str,
) -> Result<U256, VerifyError> {
    if let ExecutionStatus::Failure(reason) = &tx.status {
        return Err(VerifyError::ChainExecutionFailed(format!(
            "transaction {} failed: {reason}",
            tx.digest
        )));
    }

    let from_balances = tx.received_balance(receiver);
    if !from_balances.is_zero() {
        return Ok(from_balances);
    }

    let mut from_objects = U256::zero();
    for object_id in tx.received_coins(receiver) {
        let balance = reader
            .coin_balance(object_id)
            .await
            .map_err(|e| match e {
                LookupError::NotIndexed => VerifyError::Rpc(format!("coin {object_id} not indexed")),
                LookupError::Failed(reason) => VerifyError::Rpc(reason),
            })?;
        debug!(object_id, ?balance, "coin object resolved");
        from_objects += balance.unwrap_or_default();
    }
    if from_objects.is_zero() {
        return Err(VerifyError::RecipientMismatch {
            expected: receiver.to_string(),
            actual: None,
        });
    }
    Ok(from_objects)
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    digest: String,
    effects: Option<RawEffects>,
    #[serde(default)]
    balance_changes: Vec<RawBalanceChange>,
    #[serde(default)]
    object_changes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEffects {
    status: RawStatus,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    status: String,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBalanceChange {
    owner: Value,
    coin_type: String,
    amount: String,
}

fn address_owner(owner: &Value) -> Option<String> {
    match owner {
        Value::String(address) if address.starts_with("0x") => Some(address.clone()),
        _ => owner
            .get("AddressOwner")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn object_change(raw: &Value) -> Option<ObjectChange> {
    let kind = match raw.get("type").and_then(Value::as_str)? {
        "created" => ObjectChangeKind::Created,
        "transferred" => ObjectChangeKind::Transferred,
        "mutated" => ObjectChangeKind::Mutated,
        _ => ObjectChangeKind::Other,
    };
    let receiver = match kind {
        ObjectChangeKind::Transferred => raw.get("recipient").and_then(address_owner),
        _ => raw.get("owner").and_then(address_owner),
    };
    Some(ObjectChange {
        kind,
        object_id: raw.get("objectId").and_then(Value::as_str)?.to_string(),
        object_type: raw
            .get("objectType")
            .and_then(Value::as_str)
            .map(str::to_string),
        receiver,
    })
}

impl TryFrom<Value> for ObjectTransaction {
    type Error = LookupError;

    /// Converts a `sui_getTransactionBlock` result.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let raw: RawTransaction =
            serde_json::from_value(value).map_err(|e| LookupError::Failed(e.to_string()))?;
        let status = match raw.effects {
            Some(effects) if effects.status.status == "success" => ExecutionStatus::Success,
            Some(effects) => ExecutionStatus::Failure(
                effects
                    .status
                    .error
                    .unwrap_or_else(|| effects.status.status.clone()),
            ),
            None => return Err(LookupError::Failed("transaction has no effects".to_string())),
        };
        let balance_changes = raw
            .balance_changes
            .into_iter()
            .map(|c| {
                Ok(BalanceChange {
                    owner: address_owner(&c.owner),
                    amount: c
                        .amount
                        .parse()
                        .map_err(|_| LookupError::Failed(format!("bad amount {}", c.amount)))?,
                    coin_type: c.coin_type,
                })
            })
            .collect::<Result<_, LookupError>>()?;
        Ok(Self {
            digest: raw.digest,
            status,
            balance_changes,
            object_changes: raw.object_changes.iter().filter_map(object_change).collect(),
        })
    }
}

fn coin_balance_of(result: &Value) -> Option<U256> {
    let balance = result
        .get("data")?
        .get("content")?
        .get("fields")?
        .get("balance")?;
    match balance {
        Value::String(s) => U256::from_dec_str(s).ok(),
        Value::Number(n) => n.as_u64().map(U256::from),
        _ => None,
    }
}

/// JSON-RPC reader for one Sui fullnode.
pub struct SuiRpcReader {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl SuiRpcReader {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LookupError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let envelope: RpcEnvelope = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LookupError::Failed(e.to_string()))?
            .json()
            .await
            .map_err(|e| LookupError::Failed(e.to_string()))?;
        if let Some(fault) = envelope.error {
            if fault.message.contains(NOT_INDEXED) {
                return Err(LookupError::NotIndexed);
            }
            return Err(LookupError::Failed(fault.message));
        }
        envelope
            .result
            .ok_or_else(|| LookupError::Failed(format!("{method}: empty result")))
    }
}

#[async_trait]
impl ObjectChainReader for SuiRpcReader {
    async fn transaction(&self, digest: &str) -> Result<ObjectTransaction, LookupError> {
        let result = self
            .call(
                "sui_getTransactionBlock",
                json!([
                    digest,
                    {
                        "showEffects": true,
                        "showBalanceChanges": true,
                        "showObjectChanges": true,
                    }
                ]),
            )
            .await?;
        ObjectTransaction::try_from(result)
    }

    async fn coin_balance(&self, object_id: &str) -> Result<Option<U256>, LookupError> {
        let result = self
            .call("sui_getObject", json!([object_id, { "showContent": true }]))
            .await?;
        if result.get("error").is_some() {
            return Ok(None);
        }
        Ok(coin_balance_of(&result))
    }
}
