use crate::{
    auth::signer::{Policy, RequestSigner, SignPayload},
    transport::BrokerConnection,
    types::{
        rpc::{AuthRequestParams, AuthVerifyParams, InboundMessage, Method, RpcRequest},
        ClientError,
    },
    utils::Clock,
};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Connecting,
    AuthRequested,
    ChallengeReceived,
    Verified,
    Failed(String),
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Verified | AuthState::Failed(_))
    }
}

/// What the driver has to do after feeding a message to the handshake.
#[derive(Debug)]
pub enum AuthStep {
    /// Not part of the handshake, or arrived out of order.
    Ignore,
    /// Sign this challenge with the owner key and send the verification.
    SignChallenge(String),
    Verified,
    Failed(ClientError),
}

/// connect → auth request → challenge → verified/failed, without I/O.
#[derive(Debug)]
pub struct AuthHandshake {
    state: AuthState,
    request: AuthRequestParams,
}

impl AuthHandshake {
    pub fn new(request: AuthRequestParams) -> Self {
        Self {
            state: AuthState::Connecting,
            request,
        }
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn request(&self) -> &AuthRequestParams {
        &self.request
    }

    /// Transport is up and the auth request is going out.
    pub fn begin(&mut self) -> Result<(), ClientError> {
        if self.state != AuthState::Connecting {
            return Err(ClientError::InvalidState(format!(
                "handshake already started ({:?})",
                self.state
            )));
        }
        self.state = AuthState::AuthRequested;
        Ok(())
    }

    /// Policy the owner signs for `challenge`; exactly the fields of the
    /// auth request plus the challenge.
    pub fn policy(&self, challenge: &str) -> Policy {
        Policy {
            application: self.request.application.clone(),
            challenge: challenge.to_string(),
            scope: self.request.scope.clone(),
            wallet: self.request.address,
            session_key: self.request.session_key,
            expires_at: self.request.expires_at,
            allowances: self.request.allowances.clone(),
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = AuthState::Failed(reason.into());
        }
    }

    fn failed(&mut self, reason: String) -> AuthStep {
        self.state = AuthState::Failed(reason.clone());
        AuthStep::Failed(ClientError::AuthenticationFailed(reason))
    }

    pub fn handle(&mut self, message: &InboundMessage) -> AuthStep {
        if self.state.is_terminal() {
            return AuthStep::Ignore;
        }
        match (&self.state, message) {
            (_, InboundMessage::AuthRequired) => {
                self.failed("broker requires authentication".to_string())
            }
            (AuthState::AuthRequested | AuthState::ChallengeReceived, InboundMessage::Error(text)) => {
                self.failed(text.clone())
            }
            (AuthState::AuthRequested, InboundMessage::AuthChallenge { challenge }) => {
                self.state = AuthState::ChallengeReceived;
                AuthStep::SignChallenge(challenge.clone())
            }
            (AuthState::ChallengeReceived, InboundMessage::AuthVerify(response)) => {
                if response.success {
                    self.state = AuthState::Verified;
                    AuthStep::Verified
                } else {
                    self.failed("broker rejected the challenge signature".to_string())
                }
            }
            _ => AuthStep::Ignore,
        }
    }
}

/// Runs the handshake over `connection`. The auth request is signed by the
/// session key, the challenge by the owner. Nothing is retried.
pub async fn authenticate(
    connection: &mut BrokerConnection,
    handshake: &mut AuthHandshake,
    owner: &dyn RequestSigner,
    session: &dyn RequestSigner,
    clock: &dyn Clock,
) -> Result<(), ClientError> {
    handshake.begin()?;
    let result = drive(connection, handshake, owner, session, clock).await;
    if let Err(e) = &result {
        handshake.fail(e.to_string());
        warn!(error = %e, "authentication failed");
    }
    result
}

async fn drive(
    connection: &mut BrokerConnection,
    handshake: &mut AuthHandshake,
    owner: &dyn RequestSigner,
    session: &dyn RequestSigner,
    clock: &dyn Clock,
) -> Result<(), ClientError> {
    let request = RpcRequest::new(
        connection.next_request_id(),
        Method::AuthRequest,
        handshake.request(),
        clock.now(),
    )?;
    let signature = session
        .sign(SignPayload::Bytes(&request.canonical_bytes()?))
        .await?;
    connection
        .send(&request, &[signature])
        .await
        .map_err(lost_connection)?;

    loop {
        let inbound = connection.next_inbound().await.map_err(lost_connection)?;
        match handshake.handle(&inbound.message) {
            AuthStep::Ignore => {
                debug!(id = inbound.id, "ignoring message during authentication");
            }
            AuthStep::SignChallenge(challenge) => {
                let policy = handshake.policy(&challenge);
                let signature = owner.sign(SignPayload::Policy(&policy)).await?;
                let verify = RpcRequest::new(
                    connection.next_request_id(),
                    Method::AuthVerify,
                    &AuthVerifyParams { challenge },
                    clock.now(),
                )?;
                connection
                    .send(&verify, &[signature])
                    .await
                    .map_err(lost_connection)?;
            }
            AuthStep::Verified => {
                info!(
                    owner = ?handshake.request().address,
                    session_key = ?handshake.request().session_key,
                    "authenticated with broker"
                );
                return Ok(());
            }
            AuthStep::Failed(e) => return Err(e),
        }
    }
}

fn lost_connection(e: ClientError) -> ClientError {
    match e {
        ClientError::Transport(reason) => {
            ClientError::AuthenticationFailed(format!("connection lost during authentication: {reason}"))
        }
        other => other,
    }
}
