//! Serde helpers for token amounts. Brokers and RPC nodes send amounts as
//! decimal strings, `0x` hex strings or plain JSON numbers; we always emit
//! decimal strings.

use ethers::types::U256;
use serde::{de, Deserialize, Deserializer, Serializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Number(u64),
}

pub fn parse(text: &str) -> Result<U256, String> {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => U256::from_dec_str(text).map_err(|e| e.to_string()),
    }
}

pub fn serialize<S: Serializer>(amount: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&amount.to_string())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    match RawAmount::deserialize(deserializer)? {
        RawAmount::Text(text) => parse(&text).map_err(de::Error::custom),
        RawAmount::Number(n) => Ok(U256::from(n)),
    }
}
