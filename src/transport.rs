//! Duplex connection to the broker.
//!
//! A [`Transport`] moves text frames; [`BrokerConnection`] layers request
//! ids, signing-agnostic framing and typed dispatch of inbound frames on
//! top. Nothing here reconnects or replays requests: a closed connection
//! fails whatever is waiting on it and the caller decides what to do next.

use crate::types::{
    rpc::{decode_frame, frame_method, ChannelUpdate, Inbound, InboundMessage, Method, RpcRequest},
    ClientError,
};
use async_trait::async_trait;
use ethers::types::Signature;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<(), ClientError>;

    /// Next text frame, or `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<String, ClientError>>;

    async fn close(&mut self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ClientError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ClientError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), ClientError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| ClientError::Transport(e.to_string())),
                    )
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(ClientError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}

/// In-process transport, handy for driving the client against a scripted
/// broker.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    pub struct MemoryTransport {
        outgoing: Option<UnboundedSender<String>>,
        incoming: UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, frame: String) -> Result<(), ClientError> {
            self.outgoing
                .as_ref()
                .ok_or_else(ClientError::connection_closed)?
                .send(frame)
                .map_err(|_| ClientError::connection_closed())
        }

        async fn recv(&mut self) -> Option<Result<String, ClientError>> {
            self.incoming.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), ClientError> {
            self.outgoing = None;
            self.incoming.close();
            Ok(())
        }
    }

    /// Broker side of an in-memory connection.
    pub struct MemoryPeer {
        pub url: String,
        outgoing: UnboundedSender<String>,
        incoming: UnboundedReceiver<String>,
    }

    impl MemoryPeer {
        /// Next frame written by the client, `None` once it hung up.
        pub async fn recv(&mut self) -> Option<String> {
            self.incoming.recv().await
        }

        pub fn send(&self, frame: impl Into<String>) -> bool {
            self.outgoing.send(frame.into()).is_ok()
        }
    }

    pub fn pair(url: &str) -> (MemoryTransport, MemoryPeer) {
        let (to_peer, from_client) = unbounded_channel();
        let (to_client, from_peer) = unbounded_channel();
        (
            MemoryTransport {
                outgoing: Some(to_peer),
                incoming: from_peer,
            },
            MemoryPeer {
                url: url.to_string(),
                outgoing: to_client,
                incoming: from_client,
            },
        )
    }

    /// Hands the broker half of every new connection to a listener.
    #[derive(Clone)]
    pub struct MemoryConnector {
        accept: UnboundedSender<MemoryPeer>,
    }

    impl MemoryConnector {
        pub fn listen() -> (Self, UnboundedReceiver<MemoryPeer>) {
            let (accept, listener) = unbounded_channel();
            (Self { accept }, listener)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ClientError> {
            let (transport, peer) = pair(url);
            self.accept
                .send(peer)
                .map_err(|_| ClientError::Transport(format!("nothing listening on {url}")))?;
            Ok(Box::new(transport))
        }
    }
}

pub struct BrokerConnection {
    url: String,
    transport: Box<dyn Transport>,
    next_id: u64,
    updates: Vec<ChannelUpdate>,
}

impl BrokerConnection {
    pub async fn open(connector: &dyn Connector, url: &str) -> Result<Self, ClientError> {
        let transport = connector.connect(url).await?;
        debug!(url, "broker connection ready");
        Ok(Self {
            url: url.to_string(),
            transport,
            next_id: 1,
            updates: Vec::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub async fn send(
        &mut self,
        request: &RpcRequest,
        signatures: &[Signature],
    ) -> Result<(), ClientError> {
        let frame = request.to_frame(signatures)?;
        debug!(id = request.id, method = request.method.as_str(), "sending request");
        self.transport.send(frame).await
    }

    /// Next decodable inbound message. Frames that fail to decode are logged
    /// and skipped.
    pub async fn next_inbound(&mut self) -> Result<Inbound, ClientError> {
        self.receive(None).await
    }

    /// Like [`BrokerConnection::next_inbound`], except that an undecodable
    /// frame for the `awaited` method fails instead of being skipped.
    async fn receive(&mut self, awaited: Option<Method>) -> Result<Inbound, ClientError> {
        loop {
            let frame = match self.transport.recv().await {
                Some(frame) => frame?,
                None => return Err(ClientError::connection_closed()),
            };
            match decode_frame(&frame) {
                Ok(inbound) => return Ok(inbound),
                Err(e) => match frame_method(&frame) {
                    Some(method) if Some(method) == awaited => {
                        return Err(ClientError::Protocol(format!(
                            "malformed {} response: {e}",
                            method.as_str()
                        )))
                    }
                    _ => warn!(error = %e, "dropping undecodable broker frame"),
                },
            }
        }
    }

    /// Waits for the response of kind `expected`, optionally tagged with the
    /// request id `correlation`. Unrelated messages are skipped, channel
    /// updates are kept for [`BrokerConnection::take_updates`], and error
    /// frames end the wait with the broker's text.
    pub async fn await_response(
        &mut self,
        expected: Method,
        correlation: Option<u64>,
    ) -> Result<Inbound, ClientError> {
        loop {
            let inbound = self.receive(Some(expected)).await?;
            let wanted = inbound.message.method() == Some(expected)
                && correlation.map_or(true, |id| id == inbound.id);
            match inbound.message {
                InboundMessage::Error(text) => return Err(ClientError::Protocol(text)),
                InboundMessage::AuthRequired => {
                    return Err(ClientError::AuthenticationFailed(
                        "broker requires authentication".to_string(),
                    ))
                }
                _ if wanted => return Ok(inbound),
                InboundMessage::ChannelUpdate(update) => self.updates.push(update),
                ref message => {
                    debug!(
                        id = inbound.id,
                        method = ?message.method(),
                        expected = expected.as_str(),
                        "ignoring out-of-sequence message"
                    );
                }
            }
        }
    }

    pub fn take_updates(&mut self) -> Vec<ChannelUpdate> {
        std::mem::take(&mut self.updates)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, url = %self.url, "error while closing broker connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryConnector;
    use super::*;

    async fn connected() -> (BrokerConnection, memory::MemoryPeer) {
        let (connector, mut listener) = MemoryConnector::listen();
        let connection = BrokerConnection::open(&connector, "mem://broker").await.unwrap();
        let peer = listener.recv().await.unwrap();
        (connection, peer)
    }

    #[tokio::test]
    async fn skips_out_of_sequence_messages() {
        let (mut connection, peer) = connected().await;
        peer.send(r#"{"res":[1,"assets",{"assets":[]},0]}"#);
        peer.send(r#"{"res":[2,"auth_challenge",{"challenge_message":"c"},0]}"#);

        let inbound = connection
            .await_response(Method::AuthChallenge, None)
            .await
            .unwrap();
        assert_eq!(inbound.id, 2);
    }

    #[tokio::test]
    async fn correlation_id_filters_responses() {
        let (mut connection, peer) = connected().await;
        let close = r#"{"channel_id":"0x0000000000000000000000000000000000000000000000000000000000000001"}"#;
        peer.send(format!(r#"{{"res":[3,"close_channel",{close},0]}}"#));
        peer.send(format!(r#"{{"res":[4,"close_channel",{close},0]}}"#));

        let inbound = connection
            .await_response(Method::CloseChannel, Some(4))
            .await
            .unwrap();
        assert_eq!(inbound.id, 4);
    }

    #[tokio::test]
    async fn error_frames_surface_verbatim() {
        let (mut connection, peer) = connected().await;
        peer.send(r#"{"res":[1,"error",{"error":"channel already exists"},0]}"#);

        let err = connection
            .await_response(Method::CreateChannel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ref text) if text == "channel already exists"));
    }

    #[tokio::test]
    async fn malformed_awaited_response_fails_fast() {
        let (mut connection, peer) = connected().await;
        // create_channel without server_signature
        peer.send(r#"{"res":[1,"create_channel",{"channel_id":"0x01"},0]}"#);

        let err = connection
            .await_response(Method::CreateChannel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ref text) if text.starts_with("malformed create_channel")));
    }

    #[tokio::test]
    async fn malformed_unrelated_frames_are_skipped() {
        let (mut connection, peer) = connected().await;
        peer.send(r#"{"res":[1,"create_channel",{"channel_id":"0x01"},0]}"#);
        peer.send(r#"{"res":[2,"assets",{"assets":[]},0]}"#);

        let inbound = connection.await_response(Method::Assets, None).await.unwrap();
        assert_eq!(inbound.id, 2);
    }

    #[tokio::test]
    async fn closed_connection_fails_waiters() {
        let (mut connection, peer) = connected().await;
        drop(peer);

        let err = connection
            .await_response(Method::AuthChallenge, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }

    #[tokio::test]
    async fn channel_updates_are_kept_aside() {
        let (mut connection, peer) = connected().await;
        peer.send(r#"{"res":[0,"cu",{"channel_id":"0x0000000000000000000000000000000000000000000000000000000000000001","status":"closed","tx_hash":"0xabc"},0]}"#);
        peer.send(r#"{"res":[5,"assets",{"assets":[]},0]}"#);

        connection.await_response(Method::Assets, None).await.unwrap();
        let updates = connection.take_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].tx_hash.as_deref(), Some("0xabc"));
    }
}
