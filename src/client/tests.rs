use super::*;
use crate::{
    auth::{Eip712Signer, Policy},
    settlement::{ChainSettlement, OpenChannel},
    state::ClientRegistry,
    transport::memory::{MemoryConnector, MemoryPeer},
    types::{Channel, Intent},
    utils::{crypto::payload_digest, FixedClock},
};
use ethers::{
    signers::{LocalWallet, Signer},
    types::{RecoveryMessage, Signature},
};
use serde_json::{json, Value};
use std::{str::FromStr, sync::Mutex};

const USDC: &str = "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238";
const SETTLED_HASH: &str = "0xabababababababababababababababababababababababababababababababab";
const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

/// How the scripted broker behaves.
#[derive(Clone, Default)]
struct Script {
    auth_required: bool,
    reject_auth: bool,
    silent_create: bool,
    create_error: Option<String>,
    /// Answer create_channel with a body missing the broker signature.
    malformed_create: bool,
    resize_error: Option<String>,
    close_tx_hash: Option<String>,
    /// Settlement hash pushed as a channel update right after the close ack.
    update_after_close: Option<String>,
}

// Helper function to create a test wallet with a known private key
fn create_test_wallet() -> LocalWallet {
    LocalWallet::from_str("1234567890123456789012345678901234567890123456789012345678901234")
        .unwrap()
}

fn broker_wallet() -> LocalWallet {
    LocalWallet::from_str("4321432143214321432143214321432143214321432143214321432143214321")
        .unwrap()
}

fn reply(peer: &MemoryPeer, id: u64, method: &str, params: Value) {
    peer.send(json!({ "res": [id, method, params, 0], "sig": [] }).to_string());
}

fn decode_signature(value: &Value) -> Signature {
    let hex = value.as_str().unwrap().trim_start_matches("0x");
    Signature::try_from(hex::decode(hex).unwrap().as_slice()).unwrap()
}

/// Plays the broker side of one connection, checking every signature the
/// client sends.
async fn serve(mut peer: MemoryPeer, script: Script, owner: Address, seen: Arc<Mutex<Vec<String>>>) {
    let broker = broker_wallet();
    let mut auth_request: Option<Value> = None;
    let mut channel: Option<(H256, Channel, ChannelState)> = None;

    while let Some(frame) = peer.recv().await {
        let value: Value = serde_json::from_str(&frame).unwrap();
        let req = &value["req"];
        let id = req[0].as_u64().unwrap();
        let method = req[1].as_str().unwrap().to_string();
        let params = req[2].clone();
        let signature = decode_signature(&value["sig"][0]);
        seen.lock().unwrap().push(method.clone());

        if method == "auth_verify" {
            let request = auth_request.clone().unwrap();
            let policy = Policy {
                application: request["application"].as_str().unwrap().to_string(),
                challenge: params["challenge"].as_str().unwrap().to_string(),
                scope: request["scope"].as_str().unwrap().to_string(),
                wallet: request["address"].as_str().unwrap().parse().unwrap(),
                session_key: request["session_key"].as_str().unwrap().parse().unwrap(),
                expires_at: request["expires_at"].as_u64().unwrap(),
                allowances: vec![],
            };
            if script.reject_auth || policy.recover(&signature).unwrap() != owner {
                reply(&peer, id, "error", json!({ "error": "invalid challenge signature" }));
            } else {
                reply(
                    &peer,
                    id,
                    "auth_verify",
                    json!({ "success": true, "address": request["address"], "session_key": request["session_key"] }),
                );
            }
            continue;
        }

        // Everything else is signed by the session key named in auth_request.
        let session_key: Address = match method.as_str() {
            "auth_request" => params["session_key"].as_str().unwrap().parse().unwrap(),
            _ => auth_request.as_ref().unwrap()["session_key"]
                .as_str()
                .unwrap()
                .parse()
                .unwrap(),
        };
        let digest = payload_digest(&serde_json::to_vec(req).unwrap());
        if signature.recover(RecoveryMessage::Hash(digest)).unwrap() != session_key {
            reply(&peer, id, "error", json!({ "error": "invalid session signature" }));
            continue;
        }

        match method.as_str() {
            "auth_request" => {
                auth_request = Some(params);
                if script.auth_required {
                    peer.send("authentication required");
                } else {
                    reply(&peer, id, "auth_challenge", json!({ "challenge_message": "b4d1-challenge" }));
                }
            }
            "get_assets" => reply(
                &peer,
                id,
                "assets",
                json!({ "assets": [{ "token": USDC, "chain_id": 11_155_111, "symbol": "USDC", "decimals": 6 }] }),
            ),
            "create_channel" => {
                if script.silent_create {
                    continue;
                }
                if let Some(error) = &script.create_error {
                    reply(&peer, id, "error", json!({ "error": error }));
                    continue;
                }
                if script.malformed_create {
                    reply(&peer, id, "create_channel", json!({ "channel_id": H256::repeat_byte(1) }));
                    continue;
                }
                let token: Address = params["token"].as_str().unwrap().parse().unwrap();
                let created = Channel {
                    participants: [owner, broker.address()],
                    adjudicator: Address::repeat_byte(0xad),
                    challenge: 86_400,
                    nonce: 42,
                };
                let state = ChannelState::initial(&created, token, U256::zero());
                let channel_id = created.id();
                let server_signature = broker.sign_hash(state_hash(channel_id, &state)).unwrap();
                reply(
                    &peer,
                    id,
                    "create_channel",
                    json!({
                        "channel_id": channel_id,
                        "channel": created,
                        "state": state,
                        "server_signature": signature_hex(&server_signature.to_vec()),
                    }),
                );
                channel = Some((channel_id, created, state));
            }
            "resize_channel" if script.resize_error.is_some() => {
                reply(&peer, id, "error", json!({ "error": script.resize_error }));
            }
            "resize_channel" | "transfer" => {
                let (channel_id, _, state) = channel.clone().unwrap();
                reply(&peer, id, &method, json!({ "channel_id": channel_id, "state": state }));
            }
            "close_channel" => {
                let channel_id = params["channel_id"].clone();
                reply(
                    &peer,
                    id,
                    "close_channel",
                    json!({ "channel_id": channel_id, "tx_hash": script.close_tx_hash }),
                );
                if let Some(hash) = &script.update_after_close {
                    reply(
                        &peer,
                        0,
                        "cu",
                        json!({ "channel_id": channel_id, "status": "closed", "tx_hash": hash }),
                    );
                }
            }
            other => panic!("unexpected method {other}"),
        }
    }
}

#[derive(Default)]
struct MockSettlement {
    opened: Mutex<Vec<OpenChannel>>,
    deposits: Mutex<Vec<(Address, U256)>>,
}

#[async_trait::async_trait]
impl ChainSettlement for MockSettlement {
    async fn deposit_and_create(&self, open: &OpenChannel) -> Result<H256, ClientError> {
        self.opened.lock().unwrap().push(open.clone());
        Ok(H256::repeat_byte(0xde))
    }

    async fn deposit(&self, token: Address, amount: U256) -> Result<H256, ClientError> {
        self.deposits.lock().unwrap().push((token, amount));
        Ok(H256::repeat_byte(0xdf))
    }
}

struct Harness {
    connector: Arc<MemoryConnector>,
    owner: Arc<dyn RequestSigner>,
    settlement: Arc<MockSettlement>,
    seen: Arc<Mutex<Vec<String>>>,
}

/// Owner wallet that declines the first policy prompt, then signs normally.
struct DecliningOwner {
    inner: Eip712Signer<LocalWallet>,
    declined: Mutex<bool>,
}

#[async_trait::async_trait]
impl RequestSigner for DecliningOwner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn sign(&self, payload: SignPayload<'_>) -> Result<Signature, ClientError> {
        if matches!(payload, SignPayload::Policy(_)) {
            let mut declined = self.declined.lock().unwrap();
            if !*declined {
                *declined = true;
                return Err(ClientError::SigningRejected("user denied".to_string()));
            }
        }
        self.inner.sign(payload).await
    }
}

impl Harness {
    fn start(script: Script) -> Self {
        Self::start_with_owner(script, Arc::new(Eip712Signer::new(create_test_wallet())))
    }

    fn start_with_owner(script: Script, owner: Arc<dyn RequestSigner>) -> Self {
        let owner_address = owner.address();
        let (connector, mut listener) = MemoryConnector::listen();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        tokio::spawn(async move {
            while let Some(peer) = listener.recv().await {
                tokio::spawn(serve(peer, script.clone(), owner_address, log.clone()));
            }
        });

        Self {
            connector: Arc::new(connector),
            owner,
            settlement: Arc::new(MockSettlement::default()),
            seen,
        }
    }

    fn client(&self) -> ChannelClient {
        self.client_with(ClientConfig {
            broker_url: "mem://broker".to_string(),
            ..Default::default()
        })
    }

    fn client_with(&self, config: ClientConfig) -> ChannelClient {
        ChannelClient::new(
            config,
            self.connector.clone(),
            self.owner.clone(),
            self.settlement.clone(),
        )
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self, method: &str) -> usize {
        self.seen().iter().filter(|m| *m == method).count()
    }
}

#[tokio::test]
async fn test_create_then_close_settles() {
    let harness = Harness::start(Script {
        close_tx_hash: Some(SETTLED_HASH.to_string()),
        ..Default::default()
    });
    let mut client = harness.client();

    let created = client.create_channel(U256::from(1_000_000u64)).await.unwrap();
    assert_eq!(created.settlement_tx, H256::repeat_byte(0xde));
    assert_eq!(client.auth_state(), Some(&AuthState::Verified));
    assert_eq!(client.asset().unwrap().symbol, "USDC");

    let outcome = client
        .close_channel(created.channel_id, client.owner_address())
        .await
        .unwrap();
    let expected: H256 = SETTLED_HASH.parse().unwrap();
    assert_eq!(outcome.settlement, SettlementStatus::Settled(expected));
    assert_eq!(
        client.settlement_status(&created.channel_id),
        Some(SettlementStatus::Settled(expected))
    );
    assert!(client.channel(&created.channel_id).unwrap().state.is_final());
    assert_eq!(
        harness.seen(),
        vec!["auth_request", "auth_verify", "get_assets", "create_channel", "close_channel"]
    );
}

#[tokio::test]
async fn test_initial_state_holds_the_deposit() {
    let harness = Harness::start(Script::default());
    let mut client = harness.client();
    let deposit = U256::from(1_000_000u64);

    let created = client.create_channel(deposit).await.unwrap();
    let opened = harness.settlement.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);

    let open = &opened[0];
    let state = &open.initial_state;
    assert_eq!(open.amount, deposit);
    assert_eq!(open.token, USDC.parse::<Address>().unwrap());
    assert_eq!(state.version, 0);
    assert_eq!(state.intent, Intent::Initial);
    assert_eq!(state.total(open.token), deposit);
    assert_eq!(state.allocations[1].amount, deposit);
    assert!(state.allocations[0].amount.is_zero());

    // Owner signs the state hash as a personal message, broker signature rides along.
    assert_eq!(open.signatures.len(), 2);
    let hash = state_hash(created.channel_id, state);
    let owner_sig = Signature::try_from(open.signatures[0].as_slice()).unwrap();
    assert_eq!(
        owner_sig
            .recover(RecoveryMessage::Data(hash.as_bytes().to_vec()))
            .unwrap(),
        client.owner_address()
    );
    assert_eq!(open.signatures[1].len(), 65);
}

#[tokio::test]
async fn test_placeholder_hash_is_pending_until_update() {
    let harness = Harness::start(Script {
        close_tx_hash: Some(ZERO_HASH.to_string()),
        update_after_close: Some(SETTLED_HASH.to_string()),
        ..Default::default()
    });
    let mut client = harness.client();
    let created = client.create_channel(U256::from(10u64)).await.unwrap();

    let outcome = client
        .close_channel(created.channel_id, client.owner_address())
        .await
        .unwrap();
    assert_eq!(outcome.settlement, SettlementStatus::Pending);

    let status = client
        .await_settlement(created.channel_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, SettlementStatus::Settled(SETTLED_HASH.parse().unwrap()));
}

#[tokio::test]
async fn test_missing_hash_is_pending() {
    let harness = Harness::start(Script::default());
    let mut client = harness.client();
    let created = client.create_channel(U256::from(10u64)).await.unwrap();

    let outcome = client
        .close_channel(created.channel_id, client.owner_address())
        .await
        .unwrap();
    assert_eq!(outcome.settlement, SettlementStatus::Pending);
}

#[tokio::test]
async fn test_fund_then_transfer() {
    let harness = Harness::start(Script::default());
    let mut client = harness.client();
    let created = client.create_channel(U256::from(1_000u64)).await.unwrap();
    let id = created.channel_id;

    let funded = client.fund_channel(id, U256::from(500u64)).await.unwrap();
    assert_eq!(funded.version, 1);
    assert_eq!(funded.deposit_tx, H256::repeat_byte(0xdf));
    assert_eq!(
        harness.settlement.deposits.lock().unwrap()[0].1,
        U256::from(500u64)
    );

    let owner = client.owner_address();
    let broker = broker_wallet().address();
    let state = client
        .transfer(id, broker, owner, U256::from(300u64))
        .await
        .unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.intent, Intent::Operate);
    assert_eq!(state.allocations[0].amount, U256::from(300u64));
    assert_eq!(state.allocations[1].amount, U256::from(1_200u64));
    assert_eq!(client.channel(&id).unwrap().state, state);

    // Funding is only possible before the channel starts operating.
    let err = client.fund_channel(id, U256::one()).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
    assert_eq!(harness.count("resize_channel"), 1);
    assert_eq!(harness.count("transfer"), 1);
}

#[tokio::test]
async fn test_overdrawn_transfer_is_rejected_locally() {
    let harness = Harness::start(Script::default());
    let mut client = harness.client();
    let created = client.create_channel(U256::from(100u64)).await.unwrap();

    let err = client
        .transfer(
            created.channel_id,
            broker_wallet().address(),
            client.owner_address(),
            U256::from(101u64),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
    assert_eq!(harness.count("transfer"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_broker_times_out() {
    let harness = Harness::start(Script {
        silent_create: true,
        ..Default::default()
    });
    let mut client = harness.client();

    let err = client
        .create_channel(U256::from(1_000_000u64))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Timeout { operation: "create_channel", bound } if bound == Duration::from_secs(30)
    ));
    assert!(!client.is_connected());
    assert!(harness.settlement.opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_challenge_fails_authentication() {
    let harness = Harness::start(Script {
        reject_auth: true,
        ..Default::default()
    });
    let mut client = harness.client();

    let err = client.create_channel(U256::from(10u64)).await.unwrap_err();
    assert!(matches!(err, ClientError::AuthenticationFailed(_)));
    assert!(!client.is_connected());
    assert_eq!(harness.count("create_channel"), 0);
}

#[tokio::test]
async fn test_authentication_required_frame() {
    let harness = Harness::start(Script {
        auth_required: true,
        ..Default::default()
    });
    let mut client = harness.client();

    let err = client.create_channel(U256::from(10u64)).await.unwrap_err();
    assert!(matches!(err, ClientError::AuthenticationFailed(_)));
    assert_eq!(harness.count("auth_verify"), 0);
}

#[tokio::test]
async fn test_broker_error_is_passed_through() {
    let harness = Harness::start(Script {
        create_error: Some("insufficient custody balance".to_string()),
        ..Default::default()
    });
    let mut client = harness.client();

    let err = client.create_channel(U256::from(10u64)).await.unwrap_err();
    assert!(matches!(err, ClientError::Protocol(ref text) if text == "insufficient custody balance"));
    assert!(!client.is_connected());

    // Next attempt starts from a fresh connection and session.
    client.create_channel(U256::from(10u64)).await.unwrap_err();
    assert_eq!(harness.count("auth_request"), 2);
}

#[tokio::test]
async fn test_expired_session_drops_connection() {
    let harness = Harness::start(Script::default());
    let clock = Arc::new(FixedClock::new(1_700_000_000));
    let mut client = harness.client().with_clock(clock.clone());
    let created = client.create_channel(U256::from(100u64)).await.unwrap();

    clock.advance(3_600);
    let err = client
        .close_channel(created.channel_id, client.owner_address())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SessionExpired));
    assert!(!client.is_connected());

    // The caller reconnects and a new session key is minted.
    client
        .close_channel(created.channel_id, client.owner_address())
        .await
        .unwrap();
    assert_eq!(harness.count("auth_request"), 2);
}

#[tokio::test]
async fn test_zero_deposit_and_unknown_channel() {
    let harness = Harness::start(Script::default());
    let mut client = harness.client();

    let err = client.create_channel(U256::zero()).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
    let err = client
        .close_channel(H256::repeat_byte(1), client.owner_address())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::UnknownChannel(_)));
    assert!(harness.seen().is_empty());
}

#[tokio::test]
async fn test_registry_reuses_client_per_url() {
    let harness = Harness::start(Script::default());
    let registry = ClientRegistry::new(
        harness.connector.clone(),
        harness.owner.clone(),
        harness.settlement.clone(),
    );
    let config = ClientConfig {
        broker_url: "mem://broker".to_string(),
        ..Default::default()
    };

    let first = registry.open(config.clone()).await;
    let again = registry.open(config).await;
    assert!(Arc::ptr_eq(&first, &again));

    let other = registry
        .open(ClientConfig {
            broker_url: "mem://other".to_string(),
            ..Default::default()
        })
        .await;
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(registry.len().await, 2);

    first
        .lock()
        .await
        .create_channel(U256::from(10u64))
        .await
        .unwrap();
    assert!(registry.close("mem://broker").await);
    assert!(first.lock().await.session_address().is_none());
    assert!(!registry.close("mem://broker").await);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_declined_prompt_then_retry_authenticates() {
    let owner = Arc::new(DecliningOwner {
        inner: Eip712Signer::new(create_test_wallet()),
        declined: Mutex::new(false),
    });
    let harness = Harness::start_with_owner(Script::default(), owner);
    let mut client = harness.client();

    let err = client
        .create_channel(U256::from(1_000_000u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SigningRejected(ref text) if text == "user denied"));
    assert!(!client.is_connected());

    // Clicking again runs a fresh handshake instead of replaying the failure.
    client.create_channel(U256::from(1_000_000u64)).await.unwrap();
    assert_eq!(harness.count("auth_request"), 2);
    assert_eq!(harness.count("auth_verify"), 1);
}

#[tokio::test]
async fn test_refused_resize_reports_the_deposit() {
    let harness = Harness::start(Script {
        resize_error: Some("resize rejected".to_string()),
        ..Default::default()
    });
    let mut client = harness.client();
    let created = client.create_channel(U256::from(1_000u64)).await.unwrap();

    let err = client
        .fund_channel(created.channel_id, U256::from(500u64))
        .await
        .unwrap_err();
    match err {
        ClientError::FundingIncomplete { deposit_tx, source } => {
            assert_eq!(deposit_tx, H256::repeat_byte(0xdf));
            assert!(matches!(*source, ClientError::Protocol(ref text) if text == "resize rejected"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(harness.settlement.deposits.lock().unwrap().len(), 1);
    assert_eq!(client.channel(&created.channel_id).unwrap().state.version, 0);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_short_challenge_period_is_refused() {
    let harness = Harness::start(Script::default());
    let mut client = harness.client_with(ClientConfig {
        broker_url: "mem://broker".to_string(),
        challenge_period_secs: 2 * 86_400,
        ..Default::default()
    });

    let err = client.create_channel(U256::from(10u64)).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)));
    assert!(harness.settlement.opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_create_response_is_a_protocol_error() {
    let harness = Harness::start(Script {
        malformed_create: true,
        ..Default::default()
    });
    let mut client = harness.client();

    let err = client.create_channel(U256::from(10u64)).await.unwrap_err();
    assert!(matches!(err, ClientError::Protocol(ref text) if text.starts_with("malformed create_channel")));
    assert!(!client.is_connected());
}
