//! Channel lifecycle engine.
//!
//! A [`ChannelClient`] owns one broker connection at a time. Every operation
//! takes `&mut self`, so requests on a connection never overlap; share a
//! client through [`crate::state::ClientRegistry`] to serialize callers.

use crate::{
    assets::{fetch_assets, pinned_asset, select_asset},
    auth::{authenticate, AuthHandshake, AuthState, RequestSigner, SessionKey, SessionSigner, SignPayload},
    config::ClientConfig,
    settlement::{ChainSettlement, OpenChannel},
    state::{ChannelBook, SettlementStatus, TrackedChannel},
    transport::{BrokerConnection, Connector},
    types::{
        channel::INITIAL_VERSION,
        rpc::{
            AuthRequestParams, CloseChannelParams, CreateChannelParams, CreateChannelResponse,
            InboundMessage, Method, ResizeChannelParams, RpcRequest, TransferParams,
        },
        Asset, ChannelState, ClientError,
    },
    utils::{
        crypto::{signature_hex, state_hash},
        Clock, SystemClock,
    },
};
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedChannel {
    pub channel_id: H256,
    /// Hash of the deposit-and-register transaction.
    pub settlement_tx: H256,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundedChannel {
    pub channel_id: H256,
    pub deposit_tx: H256,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseOutcome {
    pub channel_id: H256,
    /// `Pending` means the close was acknowledged but the broker has not
    /// settled on-chain yet.
    pub settlement: SettlementStatus,
}

/// A live broker connection together with the session key minted for it.
struct Link {
    connection: BrokerConnection,
    session: SessionSigner,
    handshake: AuthHandshake,
}

pub struct ChannelClient {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    owner: Arc<dyn RequestSigner>,
    settlement: Arc<dyn ChainSettlement>,
    clock: Arc<dyn Clock>,
    link: Option<Link>,
    asset: Option<Asset>,
    channels: ChannelBook,
}

async fn send_signed<P: Serialize + Sync>(
    link: &mut Link,
    clock: &dyn Clock,
    method: Method,
    params: &P,
) -> Result<u64, ClientError> {
    let request = RpcRequest::new(link.connection.next_request_id(), method, params, clock.now())?;
    let signature = link
        .session
        .sign(SignPayload::Bytes(&request.canonical_bytes()?))
        .await?;
    link.connection.send(&request, &[signature]).await?;
    Ok(request.id)
}

fn not_connected() -> ClientError {
    ClientError::Transport("not connected".to_string())
}

async fn bounded<T>(
    operation: &'static str,
    bound: Duration,
    work: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match timeout(bound, work).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout { operation, bound }),
    }
}

impl ChannelClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        owner: Arc<dyn RequestSigner>,
        settlement: Arc<dyn ChainSettlement>,
    ) -> Self {
        Self {
            config,
            connector,
            owner,
            settlement,
            clock: Arc::new(SystemClock),
            link: None,
            asset: None,
            channels: ChannelBook::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn owner_address(&self) -> Address {
        self.owner.address()
    }

    pub fn session_address(&self) -> Option<Address> {
        self.link.as_ref().map(|link| link.session.address())
    }

    pub fn auth_state(&self) -> Option<&AuthState> {
        self.link.as_ref().map(|link| link.handshake.state())
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Asset chosen by discovery (or pinned), once known.
    pub fn asset(&self) -> Option<&Asset> {
        self.asset.as_ref()
    }

    pub fn channel(&self, id: &H256) -> Result<&TrackedChannel, ClientError> {
        self.channels.get(id)
    }

    pub fn settlement_status(&self, id: &H256) -> Option<SettlementStatus> {
        self.channels.settlement(id)
    }

    /// Opens the broker connection and mints a session key for it. A no-op
    /// while a connection is open.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.link.is_some() {
            return Ok(());
        }
        let connection =
            BrokerConnection::open(self.connector.as_ref(), &self.config.broker_url).await?;
        let expires_at = self.clock.now().saturating_add(self.config.session_ttl());
        let session = SessionSigner::new(SessionKey::generate(expires_at), self.clock.clone());
        let handshake = AuthHandshake::new(AuthRequestParams {
            address: self.owner.address(),
            session_key: session.address(),
            application: self.config.application.clone(),
            expires_at,
            scope: self.config.scope.clone(),
            allowances: self.config.requested_allowances(),
        });
        self.link = Some(Link {
            connection,
            session,
            handshake,
        });
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.connection.close().await;
            debug!(url = %self.config.broker_url, "broker connection closed");
        }
    }

    fn link_mut(&mut self) -> Result<&mut Link, ClientError> {
        self.link.as_mut().ok_or_else(not_connected)
    }

    /// Drops the connection after failures that leave it unusable.
    async fn settle<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            if e.closes_connection() {
                warn!(error = %e, "dropping broker connection");
                self.close().await;
            }
        }
        self.apply_updates();
        result
    }

    fn apply_updates(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        for update in link.connection.take_updates() {
            let status = SettlementStatus::from_reported(update.tx_hash.as_deref());
            if let SettlementStatus::Settled(hash) = status {
                if self.channels.record_settlement(&update.channel_id, status) {
                    info!(channel = ?update.channel_id, tx = ?hash, "channel settled");
                }
            }
        }
    }

    async fn ensure_authenticated(&mut self) -> Result<(), ClientError> {
        self.connect().await?;
        let now = self.clock.now();
        let expired = self
            .link
            .as_ref()
            .map_or(false, |link| link.session.key().is_expired(now));
        if expired {
            self.close().await;
            return Err(ClientError::SessionExpired);
        }
        let link = self.link.as_mut().ok_or_else(not_connected)?;
        let result = match link.handshake.state().clone() {
            AuthState::Verified => Ok(()),
            AuthState::Failed(reason) => Err(ClientError::AuthenticationFailed(reason)),
            _ => {
                authenticate(
                    &mut link.connection,
                    &mut link.handshake,
                    self.owner.as_ref(),
                    &link.session,
                    self.clock.as_ref(),
                )
                .await
            }
        };
        // A failed handshake is never resumed; the next call starts over.
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn ensure_asset(&mut self) -> Result<Asset, ClientError> {
        if let Some(asset) = &self.asset {
            return Ok(asset.clone());
        }
        let chain_id = self.config.chain_id;
        let asset = match self.config.asset {
            Some(token) => pinned_asset(token, chain_id, &[]),
            None => {
                let link = self.link.as_mut().ok_or_else(not_connected)?;
                let listed = fetch_assets(
                    &mut link.connection,
                    &link.session,
                    self.clock.as_ref(),
                    chain_id,
                )
                .await?;
                select_asset(&listed, chain_id).ok_or_else(|| {
                    ClientError::InvalidState(format!("no settlement asset for chain {chain_id}"))
                })?
            }
        };
        info!(symbol = %asset.symbol, token = ?asset.token, chain_id, "settlement asset selected");
        self.asset = Some(asset.clone());
        Ok(asset)
    }

    async fn negotiate_channel(&mut self) -> Result<CreateChannelResponse, ClientError> {
        self.ensure_authenticated().await?;
        let asset = self.ensure_asset().await?;
        let link = self.link.as_mut().ok_or_else(not_connected)?;
        send_signed(
            link,
            self.clock.as_ref(),
            Method::CreateChannel,
            &CreateChannelParams {
                chain_id: self.config.chain_id,
                token: asset.token,
            },
        )
        .await?;
        match link
            .connection
            .await_response(Method::CreateChannel, None)
            .await?
            .message
        {
            InboundMessage::ChannelCreated(response) => Ok(response),
            other => Err(ClientError::Protocol(format!(
                "expected create_channel response, got {:?}",
                other.method()
            ))),
        }
    }

    async fn sign_state(&self, channel_id: H256, state: &ChannelState) -> Result<Vec<u8>, ClientError> {
        let hash = state_hash(channel_id, state);
        let signature = self.owner.sign(SignPayload::Bytes(hash.as_bytes())).await?;
        Ok(signature.to_vec())
    }

    /// Authenticates if needed, asks the broker for a channel, countersigns
    /// its initial state and submits the deposit-and-register transaction.
    /// Everything up to the broker's answer is bounded by the request
    /// timeout.
    pub async fn create_channel(&mut self, deposit: U256) -> Result<CreatedChannel, ClientError> {
        if deposit.is_zero() {
            return Err(ClientError::InvalidState("deposit cannot be zero".to_string()));
        }
        let bound = self.config.request_timeout();
        let negotiated = bounded("create_channel", bound, self.negotiate_channel()).await;
        let response = self.settle(negotiated).await?;

        let channel_id = response.channel_id;
        if response.channel.challenge < self.config.challenge_period_secs {
            return Err(ClientError::InvalidState(format!(
                "broker proposed a {}s challenge period, at least {}s required",
                response.channel.challenge, self.config.challenge_period_secs
            )));
        }
        if response.channel.id() != channel_id {
            warn!(
                broker = ?channel_id,
                local = ?response.channel.id(),
                "broker channel id differs from locally derived id"
            );
        }
        // The broker adjudicates in the asset it answered with.
        let token = response
            .state
            .allocations
            .first()
            .map(|a| a.token)
            .ok_or_else(|| {
                ClientError::Protocol("create_channel response names no asset".to_string())
            })?;

        let mut initial = ChannelState::initial(&response.channel, token, deposit);
        initial.data = response.state.data.clone();
        debug_assert_eq!(initial.version, INITIAL_VERSION);

        let owner_signature = self.sign_state(channel_id, &initial).await?;
        let open = OpenChannel {
            token,
            amount: deposit,
            channel: response.channel.clone(),
            initial_state: initial.clone(),
            signatures: vec![owner_signature, response.server_signature.to_vec()],
        };
        let settlement_tx = self.settlement.deposit_and_create(&open).await?;

        self.channels
            .insert(channel_id, response.channel, token, initial);
        info!(channel = ?channel_id, tx = ?settlement_tx, %deposit, "channel created");
        Ok(CreatedChannel {
            channel_id,
            settlement_tx,
        })
    }

    /// Adds `amount` to a channel still in its funding phase: deposits into
    /// custody, then has the broker resize the channel.
    pub async fn fund_channel(
        &mut self,
        channel_id: H256,
        amount: U256,
    ) -> Result<FundedChannel, ClientError> {
        let tracked = self.channels.get(&channel_id)?;
        let token = tracked.token;
        let next = tracked.state.fund(amount)?;
        let signature = self.sign_state(channel_id, &next).await?;

        let authed = self.ensure_authenticated().await;
        self.settle(authed).await?;
        let deposit_tx = self.settlement.deposit(token, amount).await?;

        let params = ResizeChannelParams {
            channel_id,
            resize_amount: amount,
            funds_destination: self.owner.address(),
            state_signature: signature_hex(&signature),
        };
        let acked = self
            .exchange("resize_channel", Method::ResizeChannel, &params, false)
            .await;
        if let Err(e) = self.settle(acked).await {
            warn!(channel = ?channel_id, tx = ?deposit_tx, error = %e, "deposit made but resize failed");
            return Err(ClientError::FundingIncomplete {
                deposit_tx,
                source: Box::new(e),
            });
        }

        let version = next.version;
        self.channels.advance(&channel_id, next)?;
        info!(channel = ?channel_id, tx = ?deposit_tx, %amount, "channel funded");
        Ok(FundedChannel {
            channel_id,
            deposit_tx,
            version,
        })
    }

    /// Moves `amount` inside the channel from `from` to `to`.
    pub async fn transfer(
        &mut self,
        channel_id: H256,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<ChannelState, ClientError> {
        let tracked = self.channels.get(&channel_id)?;
        let token = tracked.token;
        let next = tracked.state.transfer(token, from, to, amount)?;
        let signature = self.sign_state(channel_id, &next).await?;

        let authed = self.ensure_authenticated().await;
        self.settle(authed).await?;
        let params = TransferParams {
            channel_id,
            destination: to,
            token,
            amount,
            version: next.version,
            state_signature: signature_hex(&signature),
        };
        let acked = self
            .exchange("transfer", Method::Transfer, &params, false)
            .await;
        self.settle(acked).await?;

        self.channels.advance(&channel_id, next.clone())?;
        debug!(channel = ?channel_id, version = next.version, "transfer acknowledged");
        Ok(next)
    }

    /// Cooperatively closes a channel, paying out to `funds_destination`.
    /// The broker may acknowledge before settling; check
    /// [`CloseOutcome::settlement`] and poll [`ChannelClient::settlement_status`].
    pub async fn close_channel(
        &mut self,
        channel_id: H256,
        funds_destination: Address,
    ) -> Result<CloseOutcome, ClientError> {
        let next = self.channels.get(&channel_id)?.state.finalize()?;
        let signature = self.sign_state(channel_id, &next).await?;

        let authed = self.ensure_authenticated().await;
        self.settle(authed).await?;
        let params = CloseChannelParams {
            channel_id,
            funds_destination,
            state_signature: signature_hex(&signature),
        };
        let acked = self
            .exchange("close_channel", Method::CloseChannel, &params, true)
            .await;
        let message = self.settle(acked).await?;

        let reported = match message {
            InboundMessage::ChannelClosed(response) => response.tx_hash,
            _ => None,
        };
        let settlement = SettlementStatus::from_reported(reported.as_deref());
        self.channels.advance(&channel_id, next)?;
        self.channels.record_settlement(&channel_id, settlement);
        match settlement {
            SettlementStatus::Settled(tx) => {
                info!(channel = ?channel_id, tx = ?tx, "channel closed and settled")
            }
            SettlementStatus::Pending => {
                info!(channel = ?channel_id, "close acknowledged, settlement pending")
            }
        }
        Ok(CloseOutcome {
            channel_id,
            settlement,
        })
    }

    /// Listens for broker channel updates until `channel_id` is settled or
    /// `wait` elapses, returning the status seen last.
    pub async fn await_settlement(
        &mut self,
        channel_id: H256,
        wait: Duration,
    ) -> Result<SettlementStatus, ClientError> {
        self.channels.get(&channel_id)?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(SettlementStatus::Settled(hash)) = self.settlement_status(&channel_id) {
                return Ok(SettlementStatus::Settled(hash));
            }
            let link = self.link_mut()?;
            let next = tokio::time::timeout_at(
                deadline,
                link.connection.await_response(Method::ChannelUpdate, None),
            )
            .await;
            let inbound = match next {
                Err(_) => return Ok(self.settlement_status(&channel_id).unwrap_or(SettlementStatus::Pending)),
                Ok(result) => self.settle(result).await?,
            };
            if let InboundMessage::ChannelUpdate(update) = inbound.message {
                let status = SettlementStatus::from_reported(update.tx_hash.as_deref());
                if matches!(status, SettlementStatus::Settled(_)) {
                    self.channels.record_settlement(&update.channel_id, status);
                }
            }
        }
    }

    /// Sends a session-signed request and waits, bounded by the request
    /// timeout, for its response. `correlate` pins the response to this
    /// request's id.
    async fn exchange<P: Serialize + Sync>(
        &mut self,
        operation: &'static str,
        method: Method,
        params: &P,
        correlate: bool,
    ) -> Result<InboundMessage, ClientError> {
        let bound = self.config.request_timeout();
        let clock = self.clock.clone();
        let link = self.link_mut()?;
        bounded(operation, bound, async move {
            let id = send_signed(link, clock.as_ref(), method, params).await?;
            let inbound = link
                .connection
                .await_response(method, correlate.then_some(id))
                .await?;
            Ok(inbound.message)
        })
        .await
    }
}

#[cfg(test)]
mod tests;
