use crate::{types::ClientError, utils::amount};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Version every channel starts at.
pub const INITIAL_VERSION: u64 = 0;

/// Index of the participant credited with the creation deposit.
pub const FUNDED_PARTICIPANT: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// `[owner, broker or peer]`
    pub participants: [Address; 2],
    pub adjudicator: Address,
    /// Challenge period in seconds.
    pub challenge: u64,
    pub nonce: u64,
}

impl Channel {
    pub fn id(&self) -> H256 {
        crate::utils::crypto::channel_id(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Intent {
    Operate,
    Initial,
    Finalize,
}

impl Intent {
    pub fn as_u8(self) -> u8 {
        match self {
            Intent::Operate => 0,
            Intent::Initial => 1,
            Intent::Finalize => 3,
        }
    }
}

impl From<Intent> for u8 {
    fn from(intent: Intent) -> Self {
        intent.as_u8()
    }
}

impl TryFrom<u8> for Intent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Intent::Operate),
            1 => Ok(Intent::Initial),
            3 => Ok(Intent::Finalize),
            other => Err(format!("unsupported state intent {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Address,
    #[serde(alias = "asset")]
    pub token: Address,
    #[serde(with = "amount")]
    pub amount: U256,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub intent: Intent,
    pub version: u64,
    #[serde(default, alias = "state_data")]
    pub data: Bytes,
    pub allocations: Vec<Allocation>,
}

impl ChannelState {
    /// Funding state: nothing for participant 0, the whole deposit for
    /// participant 1.
    pub fn initial(channel: &Channel, token: Address, deposit: U256) -> Self {
        let allocations = channel
            .participants
            .iter()
            .enumerate()
            .map(|(idx, participant)| Allocation {
                destination: *participant,
                token,
                amount: if idx == FUNDED_PARTICIPANT {
                    deposit
                } else {
                    U256::zero()
                },
            })
            .collect();
        Self {
            intent: Intent::Initial,
            version: INITIAL_VERSION,
            data: Bytes::default(),
            allocations,
        }
    }

    pub fn is_final(&self) -> bool {
        self.intent == Intent::Finalize
    }

    /// Sum of all allocations held in `token`.
    pub fn total(&self, token: Address) -> U256 {
        self.allocations
            .iter()
            .filter(|a| a.token == token)
            .fold(U256::zero(), |acc, a| acc.saturating_add(a.amount))
    }

    fn tokens(&self) -> Vec<Address> {
        let mut tokens: Vec<Address> = self.allocations.iter().map(|a| a.token).collect();
        tokens.sort();
        tokens.dedup();
        tokens
    }

    fn successor(&self, intent: Intent) -> Result<Self, ClientError> {
        if self.is_final() {
            return Err(ClientError::InvalidState(
                "channel is finalized and accepts no new states".to_string(),
            ));
        }
        let version = self
            .version
            .checked_add(1)
            .ok_or_else(|| ClientError::InvalidState("version overflow".to_string()))?;
        Ok(Self {
            intent,
            version,
            data: self.data.clone(),
            allocations: self.allocations.clone(),
        })
    }

    /// Adds `amount` to the funded allocation. Only legal while the channel
    /// has not left its funding phase.
    pub fn fund(&self, amount: U256) -> Result<Self, ClientError> {
        if self.intent != Intent::Initial {
            return Err(ClientError::InvalidState(
                "channel already operating, funding phase is over".to_string(),
            ));
        }
        let mut next = self.successor(Intent::Initial)?;
        let slot = next
            .allocations
            .get_mut(FUNDED_PARTICIPANT)
            .ok_or_else(|| ClientError::InvalidState("missing funded allocation".to_string()))?;
        slot.amount = slot
            .amount
            .checked_add(amount)
            .ok_or_else(|| ClientError::InvalidState("allocation overflow".to_string()))?;
        Ok(next)
    }

    /// Moves `amount` of `token` from `from` to `to`, appending an allocation
    /// for `to` if it has none yet.
    pub fn transfer(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<Self, ClientError> {
        if amount.is_zero() {
            return Err(ClientError::InvalidState(
                "transfer amount cannot be zero".to_string(),
            ));
        }
        let mut next = self.successor(Intent::Operate)?;
        let source = next
            .allocations
            .iter_mut()
            .find(|a| a.destination == from && a.token == token)
            .ok_or_else(|| ClientError::InvalidState(format!("{from:?} holds no allocation")))?;
        let have = source.amount;
        source.amount = have.checked_sub(amount).ok_or_else(|| {
            ClientError::InvalidState(format!(
                "insufficient allocation: need {amount}, have {have}"
            ))
        })?;

        match next
            .allocations
            .iter_mut()
            .find(|a| a.destination == to && a.token == token)
        {
            Some(target) => target.amount = target.amount.saturating_add(amount),
            None => next.allocations.push(Allocation {
                destination: to,
                token,
                amount,
            }),
        }

        self.check_successor(&next)?;
        Ok(next)
    }

    /// Final state for a cooperative close, paying out the current allocations.
    pub fn finalize(&self) -> Result<Self, ClientError> {
        self.successor(Intent::Finalize)
    }

    /// Validates that `next` may follow `self`: strictly higher version, no
    /// states after finalization, and per-token totals conserved unless
    /// `next` is a funding or finalizing state.
    pub fn check_successor(&self, next: &ChannelState) -> Result<(), ClientError> {
        if self.is_final() {
            return Err(ClientError::InvalidState(
                "channel is finalized and accepts no new states".to_string(),
            ));
        }
        if next.version <= self.version {
            return Err(ClientError::InvalidState(format!(
                "version must increase: current {}, proposed {}",
                self.version, next.version
            )));
        }
        if matches!(next.intent, Intent::Initial | Intent::Finalize) {
            return Ok(());
        }
        let mut tokens = self.tokens();
        tokens.extend(next.tokens());
        tokens.sort();
        tokens.dedup();
        for token in tokens {
            if self.total(token) != next.total(token) {
                return Err(ClientError::InvalidState(format!(
                    "allocations for {token:?} not conserved: {} != {}",
                    self.total(token),
                    next.total(token)
                )));
            }
        }
        Ok(())
    }
}
