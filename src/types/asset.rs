use ethers::types::Address;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(alias = "token_address")]
    pub token: Address,
    pub chain_id: u64,
    pub symbol: String,
    pub decimals: u8,
}
