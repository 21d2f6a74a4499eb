use crate::types::{Channel, ChannelState, ClientError};
use ethers::types::{Address, H256};
use std::collections::HashMap;

/// How far a cooperative close has progressed on-chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlementStatus {
    /// Close acknowledged, the broker settles asynchronously.
    Pending,
    Settled(H256),
}

impl SettlementStatus {
    /// Interprets a broker-reported settlement hash. Missing, empty, zero or
    /// unparsable hashes are placeholders, never a settlement.
    pub fn from_reported(tx_hash: Option<&str>) -> Self {
        match tx_hash
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .and_then(|h| h.parse::<H256>().ok())
        {
            Some(hash) if !hash.is_zero() => SettlementStatus::Settled(hash),
            _ => SettlementStatus::Pending,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackedChannel {
    pub channel: Channel,
    pub token: Address,
    pub state: ChannelState,
    pub settlement: Option<SettlementStatus>,
}

/// Channels opened through one client and the latest state of each.
#[derive(Debug, Default)]
pub struct ChannelBook {
    channels: HashMap<H256, TrackedChannel>,
}

impl ChannelBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: H256, channel: Channel, token: Address, state: ChannelState) {
        self.channels.insert(
            id,
            TrackedChannel {
                channel,
                token,
                state,
                settlement: None,
            },
        );
    }

    pub fn get(&self, id: &H256) -> Result<&TrackedChannel, ClientError> {
        self.channels.get(id).ok_or(ClientError::UnknownChannel(*id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &H256> {
        self.channels.keys()
    }

    /// Records `next` as the latest state after checking it may follow the
    /// current one.
    pub fn advance(&mut self, id: &H256, next: ChannelState) -> Result<(), ClientError> {
        let tracked = self
            .channels
            .get_mut(id)
            .ok_or(ClientError::UnknownChannel(*id))?;
        tracked.state.check_successor(&next)?;
        tracked.state = next;
        Ok(())
    }

    /// Settlement only moves forward: a settled channel stays settled.
    pub fn record_settlement(&mut self, id: &H256, status: SettlementStatus) -> bool {
        match self.channels.get_mut(id) {
            Some(tracked) => {
                if !matches!(tracked.settlement, Some(SettlementStatus::Settled(_))) {
                    tracked.settlement = Some(status);
                }
                true
            }
            None => false,
        }
    }

    pub fn settlement(&self, id: &H256) -> Option<SettlementStatus> {
        self.channels.get(id).and_then(|t| t.settlement)
    }
}
