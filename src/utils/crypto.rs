use crate::types::{Allocation, Channel, ChannelState};
use ethers::{
    abi::{encode, Token},
    types::{H256, U256},
    utils::keccak256,
};

/// Keccak digest of the canonical request bytes; this is what session keys sign.
pub fn payload_digest(payload: &[u8]) -> H256 {
    H256::from(keccak256(payload))
}

pub fn allocation_token(allocation: &Allocation) -> Token {
    Token::Tuple(vec![
        Token::Address(allocation.destination),
        Token::Address(allocation.token),
        Token::Uint(allocation.amount),
    ])
}

fn channel_fields(channel: &Channel) -> Vec<Token> {
    vec![
        Token::Array(
            channel
                .participants
                .iter()
                .map(|p| Token::Address(*p))
                .collect(),
        ),
        Token::Address(channel.adjudicator),
        Token::Uint(U256::from(channel.challenge)),
        Token::Uint(U256::from(channel.nonce)),
    ]
}

pub fn channel_token(channel: &Channel) -> Token {
    Token::Tuple(channel_fields(channel))
}

/// `State` tuple as the custody contract takes it, signatures included.
pub fn state_token(state: &ChannelState, signatures: &[Vec<u8>]) -> Token {
    Token::Tuple(vec![
        Token::Uint(U256::from(state.intent.as_u8())),
        Token::Uint(U256::from(state.version)),
        Token::Bytes(state.data.to_vec()),
        Token::Array(state.allocations.iter().map(allocation_token).collect()),
        Token::Array(
            signatures
                .iter()
                .map(|sig| Token::Bytes(sig.clone()))
                .collect(),
        ),
    ])
}

/// Deterministic channel identifier derived from the immutable channel fields.
pub fn channel_id(channel: &Channel) -> H256 {
    H256::from(keccak256(encode(&channel_fields(channel))))
}

/// Hash both participants sign for a given state of a channel.
pub fn state_hash(channel_id: H256, state: &ChannelState) -> H256 {
    let encoded = encode(&[
        Token::FixedBytes(channel_id.as_bytes().to_vec()),
        Token::Uint(U256::from(state.intent.as_u8())),
        Token::Uint(U256::from(state.version)),
        Token::Bytes(state.data.to_vec()),
        Token::Array(state.allocations.iter().map(allocation_token).collect()),
    ]);
    H256::from(keccak256(encoded))
}

/// Lowercased, `0x`-stripped hex with leading zeros removed, so that
/// `0xABCD`, `0xabcd` and `0x00abcd` compare equal.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let hex = hex.trim_start_matches('0').to_ascii_lowercase();
    if hex.is_empty() {
        "0".to_string()
    } else {
        hex
    }
}

pub fn same_address(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Normalizes the package address of a Move type tag (`0x2::sui::SUI`), keeping
/// generic parameters intact.
pub fn normalize_type_tag(tag: &str) -> String {
    let (head, generics) = match tag.find('<') {
        Some(idx) => (&tag[..idx], Some(&tag[idx..])),
        None => (tag, None),
    };
    let mut parts = head.splitn(2, "::");
    let address = parts.next().unwrap_or_default();
    let mut normalized = match parts.next() {
        Some(rest) => format!("0x{}::{}", normalize_address(address), rest),
        None => head.to_string(),
    };
    if let Some(generics) = generics {
        let inner = generics.trim_start_matches('<').trim_end_matches('>');
        let params: Vec<String> = inner
            .split(',')
            .map(|p| normalize_type_tag(p.trim()))
            .collect();
        normalized.push('<');
        normalized.push_str(&params.join(", "));
        normalized.push('>');
    }
    normalized
}

pub fn signature_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Intent;
    use ethers::types::Address;

    fn sample_channel() -> Channel {
        Channel {
            participants: [Address::repeat_byte(0x11), Address::repeat_byte(0x22)],
            adjudicator: Address::repeat_byte(0x33),
            challenge: 3600,
            nonce: 7,
        }
    }

    #[test]
    fn channel_id_is_deterministic_and_field_sensitive() {
        let channel = sample_channel();
        assert_eq!(channel_id(&channel), channel_id(&channel.clone()));

        let mut other = channel.clone();
        other.nonce += 1;
        assert_ne!(channel_id(&channel), channel_id(&other));
    }

    #[test]
    fn state_hash_changes_with_version() {
        let id = channel_id(&sample_channel());
        let mut state = ChannelState {
            intent: Intent::Operate,
            version: 1,
            data: Default::default(),
            allocations: vec![],
        };
        let first = state_hash(id, &state);
        state.version = 2;
        assert_ne!(first, state_hash(id, &state));
    }

    #[test]
    fn addresses_compare_case_and_prefix_insensitively() {
        assert!(same_address("0xABCDef", "0xabcdef"));
        assert!(same_address("abcdef", "0x00ABCDEF"));
        assert!(!same_address("0xabcd", "0x1234"));
    }

    #[test]
    fn type_tags_normalize_package_address() {
        assert_eq!(
            normalize_type_tag("0x0000000000000000000000000000000000000000000000000000000000000002::sui::SUI"),
            "0x2::sui::SUI"
        );
        assert_eq!(
            normalize_type_tag("0x2::coin::Coin<0x0002::sui::SUI>"),
            "0x2::coin::Coin<0x2::sui::SUI>"
        );
    }
}
