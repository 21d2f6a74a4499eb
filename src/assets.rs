//! Asset discovery and settlement-asset selection.

use crate::{
    auth::{RequestSigner, SignPayload},
    transport::BrokerConnection,
    types::{
        rpc::{GetAssetsParams, InboundMessage, Method, RpcRequest},
        Asset, ClientError,
    },
    utils::Clock,
};
use ethers::types::Address;
use tracing::{debug, warn};

/// Well-known USDC deployments used when the broker does not list the chain.
const DEFAULT_ASSETS: &[(u64, &str, &str, u8)] = &[
    (1, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "USDC", 6),
    (137, "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359", "USDC", 6),
    (8453, "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", "USDC", 6),
    (11_155_111, "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238", "USDC", 6),
];

pub fn default_asset(chain_id: u64) -> Option<Asset> {
    DEFAULT_ASSETS
        .iter()
        .find(|(chain, ..)| *chain == chain_id)
        .and_then(|(chain, token, symbol, decimals)| {
            Some(Asset {
                token: token.parse().ok()?,
                chain_id: *chain,
                symbol: symbol.to_string(),
                decimals: *decimals,
            })
        })
}

fn is_stable(asset: &Asset) -> bool {
    asset.symbol.to_ascii_lowercase().contains("usd")
}

/// Chooses the settlement asset for `chain_id`: a USD-pegged token if the
/// broker lists one, else the first listed token, else the built-in default.
pub fn select_asset(assets: &[Asset], chain_id: u64) -> Option<Asset> {
    let on_chain: Vec<&Asset> = assets.iter().filter(|a| a.chain_id == chain_id).collect();
    if let Some(stable) = on_chain.iter().find(|a| is_stable(a)) {
        return Some((*stable).clone());
    }
    if let Some(first) = on_chain.first() {
        return Some((*first).clone());
    }
    let fallback = default_asset(chain_id);
    if fallback.is_some() {
        warn!(chain_id, "broker lists no assets for chain, using built-in default");
    }
    fallback
}

/// Resolves a pinned token to full metadata where we know it.
pub fn pinned_asset(token: Address, chain_id: u64, listed: &[Asset]) -> Asset {
    listed
        .iter()
        .find(|a| a.token == token && a.chain_id == chain_id)
        .cloned()
        .or_else(|| default_asset(chain_id).filter(|a| a.token == token))
        .unwrap_or(Asset {
            token,
            chain_id,
            symbol: String::new(),
            decimals: 0,
        })
}

pub async fn fetch_assets(
    connection: &mut BrokerConnection,
    session: &dyn RequestSigner,
    clock: &dyn Clock,
    chain_id: u64,
) -> Result<Vec<Asset>, ClientError> {
    let request = RpcRequest::new(
        connection.next_request_id(),
        Method::GetAssets,
        &GetAssetsParams { chain_id },
        clock.now(),
    )?;
    let signature = session
        .sign(SignPayload::Bytes(&request.canonical_bytes()?))
        .await?;
    connection.send(&request, &[signature]).await?;

    match connection.await_response(Method::Assets, None).await?.message {
        InboundMessage::Assets(assets) => {
            debug!(count = assets.len(), "broker assets received");
            Ok(assets)
        }
        other => Err(ClientError::Protocol(format!(
            "expected asset list, got {:?}",
            other.method()
        ))),
    }
}
