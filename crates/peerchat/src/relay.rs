//! Bundled signaling relay.
//!
//! A minimal WebSocket rendezvous server. Each socket must open with
//! `register {userId}`. After that, `offer`, `answer`, `candidate` and `busy`
//! envelopes are forwarded to `payload.targetUserId` with `from` set to the
//! registered id of the sender. The relay never looks inside SDP or
//! candidates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::signaling::{ErrorPayload, UserDisconnectedPayload};
use protocol::{ProtocolError, SignalEnvelope, SignalMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a new socket may stay silent before it must have registered.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Error text sent back when a target is not registered.
pub const USER_NOT_FOUND: &str = "User not found or offline";

/// Errors raised by the relay server.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

struct Client {
    connection: u64,
    tx: mpsc::UnboundedSender<WsMessage>,
}

/// Registered sockets by user id.
#[derive(Default)]
struct Hub {
    clients: RwLock<HashMap<String, Client>>,
    next_connection: AtomicU64,
}

impl Hub {
    /// Bind `user_id` to a socket. An older socket for the same id is closed.
    async fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<WsMessage>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .clients
            .write()
            .await
            .insert(user_id.to_string(), Client { connection, tx });

        if let Some(previous) = previous {
            info!(user_id = %user_id, "user registered again, replacing older socket");
            let _ = previous.tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Replaced by a newer connection".into(),
            })));
        }
        connection
    }

    /// Remove `user_id` if it is still bound to `connection`.
    async fn unregister(&self, user_id: &str, connection: u64) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(user_id) {
            Some(client) if client.connection == connection => {
                clients.remove(user_id);
                true
            }
            _ => false,
        }
    }

    async fn deliver(&self, user_id: &str, text: String) -> bool {
        match self.clients.read().await.get(user_id) {
            Some(client) => client.tx.send(WsMessage::Text(text)).is_ok(),
            None => false,
        }
    }

    async fn broadcast(&self, text: &str) {
        for client in self.clients.read().await.values() {
            let _ = client.tx.send(WsMessage::Text(text.to_string()));
        }
    }

    async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.clients.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// Forward one envelope from `from`.
    async fn route(&self, from: &str, text: &str) {
        let mut envelope = match SignalEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from = %from, error = %e, "dropping malformed envelope");
                return;
            }
        };

        match envelope.kind.as_str() {
            "offer" | "answer" | "candidate" | "busy" => {}
            "register" => {
                warn!(from = %from, "ignoring repeated register");
                return;
            }
            other => {
                debug!(from = %from, kind = %other, "ignoring unhandled message type");
                return;
            }
        }

        let Some(target) = envelope
            .payload
            .get("targetUserId")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
        else {
            warn!(from = %from, kind = %envelope.kind, "envelope without targetUserId");
            return;
        };

        envelope.from = Some(from.to_string());
        let forwarded = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to re-encode envelope");
                return;
            }
        };

        if self.deliver(&target, forwarded).await {
            debug!(from = %from, to = %target, kind = %envelope.kind, "forwarded");
        } else {
            info!(from = %from, to = %target, "target not registered");
            if let Err(e) = self.reply_not_found(from, &target).await {
                warn!(error = %e, "failed to build error reply");
            }
        }
    }

    async fn reply_not_found(&self, recipient: &str, target: &str) -> Result<(), RelayError> {
        let reply = SignalMessage::Error(ErrorPayload {
            message: USER_NOT_FOUND.to_string(),
            target_user_id: Some(target.to_string()),
            target_user: Some(target.to_string()),
        })
        .into_envelope(None)?
        .to_json()?;
        if !self.deliver(recipient, reply).await {
            debug!(recipient = %recipient, "sender left before the error reply");
        }
        Ok(())
    }

    async fn announce_departure(&self, user_id: &str) -> Result<(), RelayError> {
        let notice = SignalMessage::UserDisconnected(UserDisconnectedPayload {
            user_id: user_id.to_string(),
        })
        .into_envelope(None)?
        .to_json()?;
        self.broadcast(&notice).await;
        Ok(())
    }
}

/// Cloneable view of a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    hub: Arc<Hub>,
    shutdown: CancellationToken,
}

impl RelayHandle {
    /// Registered user ids, sorted.
    pub async fn users(&self) -> Vec<String> {
        self.hub.users().await
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            hub: Arc::new(Hub::default()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            hub: Arc::clone(&self.hub),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until shut down.
    pub async fn run(self) -> Result<(), RelayError> {
        info!(addr = %self.local_addr()?, "signaling relay listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("signaling relay stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let hub = Arc::clone(&self.hub);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, hub).await {
                                debug!(addr = %addr, error = %e, "relay connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<Hub>,
) -> Result<(), RelayError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let user_id = match tokio::time::timeout(REGISTER_TIMEOUT, read_register(&mut source)).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) | Err(_) => {
            warn!(addr = %addr, "closing socket that did not register");
            sink.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "Registration required".into(),
            })))
            .await?;
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connection = hub.register(&user_id, tx).await;
    info!(user_id = %user_id, addr = %addr, "client registered");

    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => hub.route(&user_id, &text).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "read failed");
                break;
            }
        }
    }

    if hub.unregister(&user_id, connection).await {
        info!(user_id = %user_id, "client disconnected");
        hub.announce_departure(&user_id).await?;
    }
    writer.abort();
    Ok(())
}

/// Read frames until the first text frame and accept it only as a register.
async fn read_register<S>(source: &mut S) -> Option<String>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(frame) = source.next().await {
        let text = match frame.ok()? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return None,
            _ => continue,
        };
        let envelope = SignalEnvelope::from_json(&text).ok()?;
        return match envelope.message().ok()? {
            SignalMessage::Register(payload) if !payload.user_id.is_empty() => {
                Some(payload.user_id)
            }
            other => {
                warn!(kind = %other.kind(), "expected register as the first message");
                None
            }
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::signaling::{RegisterPayload, SdpPayload};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_relay() -> (String, RelayHandle) {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", server.local_addr().unwrap());
        let handle = server.handle();
        tokio::spawn(server.run());
        (url, handle)
    }

    async fn send(socket: &mut Socket, message: SignalMessage) {
        let text = message.into_envelope(None).unwrap().to_json().unwrap();
        socket.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn register(url: &str, handle: &RelayHandle, user_id: &str) -> Socket {
        let (mut socket, _) = connect_async(url).await.unwrap();
        send(
            &mut socket,
            SignalMessage::Register(RegisterPayload {
                user_id: user_id.to_string(),
            }),
        )
        .await;
        for _ in 0..200 {
            if handle.users().await.iter().any(|u| u == user_id) {
                return socket;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{user_id} never registered");
    }

    async fn next_envelope(socket: &mut Socket) -> SignalEnvelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for relay")
                .expect("socket ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return SignalEnvelope::from_json(&text).unwrap();
            }
        }
    }

    fn offer(target: &str) -> SignalMessage {
        SignalMessage::Offer(SdpPayload {
            target_user_id: target.to_string(),
            sdp: "v=0".to_string(),
        })
    }

    #[tokio::test]
    async fn test_forwards_with_sender_injected() {
        let (url, handle) = start_relay().await;
        let mut alice = register(&url, &handle, "alice").await;
        let mut bob = register(&url, &handle, "bob").await;

        send(&mut alice, offer("bob")).await;
        let envelope = next_envelope(&mut bob).await;
        assert_eq!(envelope.kind, "offer");
        assert_eq!(envelope.from.as_deref(), Some("alice"));
        assert_eq!(envelope.message().unwrap(), offer("bob"));
    }

    #[tokio::test]
    async fn test_unknown_target_gets_error() {
        let (url, handle) = start_relay().await;
        let mut alice = register(&url, &handle, "alice").await;

        send(&mut alice, offer("ghost")).await;
        let envelope = next_envelope(&mut alice).await;
        match envelope.message().unwrap() {
            SignalMessage::Error(payload) => {
                assert_eq!(payload.message, USER_NOT_FOUND);
                assert_eq!(payload.target(), Some("ghost"));
                assert_eq!(payload.target_user.as_deref(), Some("ghost"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_message_must_register() {
        let (url, handle) = start_relay().await;
        let (mut socket, _) = connect_async(&url).await.unwrap();
        send(&mut socket, offer("bob")).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap();
        assert!(matches!(frame, Some(Ok(WsMessage::Close(_))) | None | Some(Err(_))));
        assert!(handle.users().await.is_empty());
    }

    #[tokio::test]
    async fn test_departure_is_broadcast() {
        let (url, handle) = start_relay().await;
        let alice = register(&url, &handle, "alice").await;
        let mut bob = register(&url, &handle, "bob").await;

        drop(alice);
        let envelope = next_envelope(&mut bob).await;
        assert_eq!(
            envelope.message().unwrap(),
            SignalMessage::UserDisconnected(UserDisconnectedPayload {
                user_id: "alice".into()
            })
        );
        assert_eq!(handle.users().await, vec!["bob"]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces_older_socket() {
        let (url, handle) = start_relay().await;
        let mut first = register(&url, &handle, "bob").await;
        let mut alice = register(&url, &handle, "alice").await;
        let mut second = register(&url, &handle, "bob").await;

        // The older socket is closed by the relay
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match first.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        send(&mut alice, offer("bob")).await;
        let envelope = next_envelope(&mut second).await;
        assert_eq!(envelope.from.as_deref(), Some("alice"));

        // Replacement does not announce bob as gone
        assert_eq!(handle.users().await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_envelope_without_target_is_dropped() {
        let (url, handle) = start_relay().await;
        let mut alice = register(&url, &handle, "alice").await;
        let mut bob = register(&url, &handle, "bob").await;

        alice
            .send(WsMessage::Text(r#"{"type":"offer","payload":{"sdp":"x"}}"#.into()))
            .await
            .unwrap();
        send(&mut alice, offer("bob")).await;

        // Only the well-formed offer arrives
        let envelope = next_envelope(&mut bob).await;
        assert_eq!(envelope.message().unwrap(), offer("bob"));
    }
}
