//! Broker wire protocol.
//!
//! Requests travel as `{"req":[id, method, params, timestamp], "sig":[...]}`
//! and responses as `{"res":[id, method, params, timestamp], "sig":[...]}`.
//! Inbound frames are decoded once into [`InboundMessage`] so the client
//! dispatches on a closed set of message kinds instead of poking at JSON.

use crate::{
    types::{Asset, Channel, ChannelState, ClientError},
    utils::{amount, crypto::signature_hex},
};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Literal frame a broker sends when it refuses the connection outright.
pub const AUTH_REQUIRED: &str = "authentication required";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    AuthRequest,
    AuthChallenge,
    AuthVerify,
    GetAssets,
    Assets,
    CreateChannel,
    ResizeChannel,
    Transfer,
    CloseChannel,
    ChannelUpdate,
    Error,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::AuthRequest => "auth_request",
            Method::AuthChallenge => "auth_challenge",
            Method::AuthVerify => "auth_verify",
            Method::GetAssets => "get_assets",
            Method::Assets => "assets",
            Method::CreateChannel => "create_channel",
            Method::ResizeChannel => "resize_channel",
            Method::Transfer => "transfer",
            Method::CloseChannel => "close_channel",
            Method::ChannelUpdate => "cu",
            Method::Error => "error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "auth_request" => Method::AuthRequest,
            "auth_challenge" => Method::AuthChallenge,
            "auth_verify" => Method::AuthVerify,
            "get_assets" => Method::GetAssets,
            "assets" => Method::Assets,
            "create_channel" => Method::CreateChannel,
            "resize_channel" => Method::ResizeChannel,
            "transfer" => Method::Transfer,
            "close_channel" => Method::CloseChannel,
            "cu" | "channel_update" => Method::ChannelUpdate,
            "error" => Method::Error,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RpcRequest {
    pub id: u64,
    pub method: Method,
    pub params: Value,
    pub timestamp: u64,
}

impl RpcRequest {
    pub fn new<P: Serialize>(
        id: u64,
        method: Method,
        params: &P,
        timestamp: u64,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            id,
            method,
            params: serde_json::to_value(params)?,
            timestamp,
        })
    }

    fn body(&self) -> Value {
        json!([self.id, self.method.as_str(), self.params, self.timestamp])
    }

    /// Bytes covered by request signatures.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ClientError> {
        Ok(serde_json::to_vec(&self.body())?)
    }

    pub fn to_frame(&self, signatures: &[Signature]) -> Result<String, ClientError> {
        let sigs: Vec<String> = signatures
            .iter()
            .map(|sig| signature_hex(&sig.to_vec()))
            .collect();
        Ok(serde_json::to_string(&json!({ "req": self.body(), "sig": sigs }))?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub asset: String,
    pub amount: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthRequestParams {
    pub address: Address,
    pub session_key: Address,
    pub application: String,
    pub expires_at: u64,
    pub scope: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowances: Vec<Allowance>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthVerifyParams {
    pub challenge: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GetAssetsParams {
    pub chain_id: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CreateChannelParams {
    pub chain_id: u64,
    pub token: Address,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResizeChannelParams {
    pub channel_id: H256,
    #[serde(with = "amount")]
    pub resize_amount: U256,
    pub funds_destination: Address,
    pub state_signature: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TransferParams {
    pub channel_id: H256,
    pub destination: Address,
    pub token: Address,
    #[serde(with = "amount")]
    pub amount: U256,
    pub version: u64,
    pub state_signature: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct CloseChannelParams {
    pub channel_id: H256,
    pub funds_destination: Address,
    pub state_signature: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthVerifyResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub session_key: Option<Address>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateChannelResponse {
    pub channel_id: H256,
    pub channel: Channel,
    pub state: ChannelState,
    pub server_signature: Bytes,
}

/// Broker acknowledgement carrying a countersigned state.
#[derive(Clone, Debug, Deserialize)]
pub struct StateResponse {
    pub channel_id: H256,
    pub state: ChannelState,
    #[serde(default)]
    pub server_signature: Option<Bytes>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CloseChannelResponse {
    pub channel_id: H256,
    #[serde(default)]
    pub state: Option<ChannelState>,
    #[serde(default)]
    pub server_signature: Option<Bytes>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelUpdate {
    pub channel_id: H256,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AssetList {
    Wrapped { assets: Vec<Asset> },
    Bare(Vec<Asset>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorParams {
    Wrapped { error: String },
    Bare(String),
}

#[derive(Deserialize)]
struct AuthChallengeParams {
    #[serde(alias = "challenge")]
    challenge_message: String,
}

#[derive(Clone, Debug)]
pub enum InboundMessage {
    /// Raw rejection frame sent before any challenge.
    AuthRequired,
    AuthChallenge { challenge: String },
    AuthVerify(AuthVerifyResponse),
    Assets(Vec<Asset>),
    ChannelCreated(CreateChannelResponse),
    ChannelResized(StateResponse),
    Transferred(StateResponse),
    ChannelClosed(CloseChannelResponse),
    ChannelUpdate(ChannelUpdate),
    Error(String),
    /// A method this client does not consume.
    Unknown(String),
}

impl InboundMessage {
    pub fn method(&self) -> Option<Method> {
        Some(match self {
            InboundMessage::AuthRequired | InboundMessage::Unknown(_) => return None,
            InboundMessage::AuthChallenge { .. } => Method::AuthChallenge,
            InboundMessage::AuthVerify(_) => Method::AuthVerify,
            InboundMessage::Assets(_) => Method::Assets,
            InboundMessage::ChannelCreated(_) => Method::CreateChannel,
            InboundMessage::ChannelResized(_) => Method::ResizeChannel,
            InboundMessage::Transferred(_) => Method::Transfer,
            InboundMessage::ChannelClosed(_) => Method::CloseChannel,
            InboundMessage::ChannelUpdate(_) => Method::ChannelUpdate,
            InboundMessage::Error(_) => Method::Error,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Inbound {
    pub id: u64,
    pub message: InboundMessage,
}

#[derive(Deserialize)]
struct RawFrame {
    res: Vec<Value>,
}

fn params<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, ClientError> {
    Ok(serde_json::from_value(value)?)
}

/// Method named by a response frame, read without decoding its params.
pub fn frame_method(text: &str) -> Option<Method> {
    let frame: RawFrame = serde_json::from_str(text.trim()).ok()?;
    Method::parse(frame.res.get(1)?.as_str()?)
}

/// Decodes one text frame from the broker.
pub fn decode_frame(text: &str) -> Result<Inbound, ClientError> {
    let trimmed = text.trim();
    if trimmed.trim_matches('"').eq_ignore_ascii_case(AUTH_REQUIRED) {
        return Ok(Inbound {
            id: 0,
            message: InboundMessage::AuthRequired,
        });
    }

    let frame: RawFrame = serde_json::from_str(trimmed)?;
    let mut fields = frame.res.into_iter();
    let id = fields.next().and_then(|v| v.as_u64()).unwrap_or_default();
    let method = match fields.next() {
        Some(Value::String(method)) => method,
        _ => return Err(ClientError::Protocol("response without method".to_string())),
    };
    let body = fields.next().unwrap_or(Value::Null);
    // Some brokers wrap params in a single-element array.
    let body = match body {
        Value::Array(mut items) if items.len() == 1 && items[0].is_object() => items.remove(0),
        other => other,
    };

    let message = match Method::parse(&method) {
        Some(Method::AuthChallenge) => InboundMessage::AuthChallenge {
            challenge: params::<AuthChallengeParams>(body)?.challenge_message,
        },
        Some(Method::AuthVerify) => InboundMessage::AuthVerify(params(body)?),
        Some(Method::GetAssets | Method::Assets) => {
            let assets = match params::<AssetList>(body)? {
                AssetList::Wrapped { assets } | AssetList::Bare(assets) => assets,
            };
            InboundMessage::Assets(assets)
        }
        Some(Method::CreateChannel) => InboundMessage::ChannelCreated(params(body)?),
        Some(Method::ResizeChannel) => InboundMessage::ChannelResized(params(body)?),
        Some(Method::Transfer) => InboundMessage::Transferred(params(body)?),
        Some(Method::CloseChannel) => InboundMessage::ChannelClosed(params(body)?),
        Some(Method::ChannelUpdate) => InboundMessage::ChannelUpdate(params(body)?),
        Some(Method::Error) => {
            let text = match params::<ErrorParams>(body) {
                Ok(ErrorParams::Wrapped { error } | ErrorParams::Bare(error)) => error,
                Err(_) => "unspecified broker error".to_string(),
            };
            InboundMessage::Error(text)
        }
        Some(Method::AuthRequest) | None => InboundMessage::Unknown(method),
    };

    Ok(Inbound { id, message })
}
