//! WebRTC transport for peer sessions.
//!
//! This module implements the transport seam on top of webrtc-rs:
//! - ICE server configuration (STUN/TURN)
//! - Offer/answer creation and remote description handling
//! - Trickled ICE candidates in both directions
//! - One ordered data channel per session
//!
//! Every webrtc-rs callback is forwarded to the session's [`EventSink`].

use std::sync::Arc;

use bytes::Bytes;
use protocol::signaling::IceCandidate;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    BoxFuture, ChannelError, ChannelMessage, DataChannel, EventSink, PeerTransport, SdpKind,
    TransportError, TransportEvent, TransportFactory, TransportResult,
};
use crate::session::state::{IceConnectionState, PeerConnectionState, SignalingState};

/// Default STUN servers for ICE connectivity.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// ICE server configuration.
#[derive(Debug, Clone)]
pub struct IceServer {
    /// STUN/TURN server URLs.
    pub urls: Vec<String>,
    /// Username for TURN authentication (optional for STUN).
    pub username: Option<String>,
    /// Credential for TURN authentication (optional for STUN).
    pub credential: Option<String>,
}

impl IceServer {
    /// Creates a new STUN server configuration.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Creates a new TURN server configuration with authentication.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(server: IceServer) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Configuration for WebRTC transports.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// ICE servers for connectivity.
    pub ice_servers: Vec<IceServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self::from_stun_urls(DEFAULT_STUN_SERVERS.iter().copied())
    }
}

impl WebRtcConfig {
    /// Build a configuration from plain STUN URLs.
    pub fn from_stun_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ice_servers: urls.into_iter().map(IceServer::stun).collect(),
        }
    }

    /// Converts to WebRTC RTCConfiguration.
    fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().cloned().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// Builds a webrtc-rs peer connection per session.
pub struct WebRtcTransportFactory {
    api: API,
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    /// Set up the media engine and interceptors once for all sessions.
    pub fn new(config: WebRtcConfig) -> TransportResult<Self> {
        // Create a MediaEngine (required even for data-only connections)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Creation(format!("failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            TransportError::Creation(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config })
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create(&self, sink: EventSink) -> BoxFuture<'_, TransportResult<Arc<dyn PeerTransport>>> {
        Box::pin(async move {
            let peer_connection = self
                .api
                .new_peer_connection(self.config.to_rtc_configuration())
                .await
                .map_err(|e| {
                    TransportError::Creation(format!("failed to create peer connection: {}", e))
                })?;
            let peer_connection = Arc::new(peer_connection);
            wire_peer_connection(&peer_connection, &sink);

            debug!(peer_id = %sink.peer_id(), generation = sink.generation(), "created peer connection");
            Ok(Arc::new(WebRtcTransport {
                peer_connection,
                sink,
            }) as Arc<dyn PeerTransport>)
        })
    }
}

/// Forward peer connection callbacks to the sink.
fn wire_peer_connection(pc: &Arc<RTCPeerConnection>, sink: &EventSink) {
    let s = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let s = s.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => Some(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => {
                        warn!(error = %e, "failed to serialize local ICE candidate");
                        return;
                    }
                },
                None => None,
            };
            s.emit(TransportEvent::LocalCandidate(candidate));
        })
    }));

    let s = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let s = s.clone();
        Box::pin(async move {
            if let Some(state) = map_ice_state(state) {
                s.emit(TransportEvent::IceConnectionState(state));
            }
        })
    }));

    let s = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let s = s.clone();
        Box::pin(async move {
            if let Some(state) = map_connection_state(state) {
                s.emit(TransportEvent::ConnectionState(state));
            }
        })
    }));

    let s = sink.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let s = s.clone();
        Box::pin(async move {
            if let Some(state) = map_signaling_state(state) {
                s.emit(TransportEvent::SignalingState(state));
            }
        })
    }));

    let s = sink.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let s = s.clone();
        Box::pin(async move {
            debug!(peer_id = %s.peer_id(), label = %channel.label(), "remote opened data channel");
            s.emit(TransportEvent::IncomingChannel(Arc::new(WebRtcDataChannel {
                channel: Arc::clone(&channel),
            })));
            wire_data_channel(&channel, &s);
        })
    }));
}

/// Forward data channel callbacks to the sink.
fn wire_data_channel(channel: &Arc<RTCDataChannel>, sink: &EventSink) {
    let s = sink.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            s.emit(TransportEvent::ChannelOpen);
        })
    }));

    let s = sink.clone();
    channel.on_close(Box::new(move || {
        let s = s.clone();
        Box::pin(async move {
            s.emit(TransportEvent::ChannelClose);
        })
    }));

    let s = sink.clone();
    channel.on_error(Box::new(move |err: webrtc::Error| {
        let s = s.clone();
        Box::pin(async move {
            s.emit(TransportEvent::ChannelError(ChannelError::new(
                "OperationError",
                err.to_string(),
            )));
        })
    }));

    let s = sink.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let s = s.clone();
        Box::pin(async move {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            s.emit(TransportEvent::ChannelMessage(message));
        })
    }));
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Unspecified => return None,
    })
}

/// A webrtc-rs peer connection bound to one session.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    sink: EventSink,
}

impl PeerTransport for WebRtcTransport {
    fn create_data_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, TransportResult<Arc<dyn DataChannel>>> {
        Box::pin(async move {
            let options = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = self
                .peer_connection
                .create_data_channel(label, Some(options))
                .await
                .map_err(|e| {
                    TransportError::Channel(format!("failed to create data channel: {}", e))
                })?;
            wire_data_channel(&channel, &self.sink);
            Ok(Arc::new(WebRtcDataChannel { channel }) as Arc<dyn DataChannel>)
        })
    }

    fn create_offer(&self) -> BoxFuture<'_, TransportResult<String>> {
        Box::pin(async move {
            let offer = self.peer_connection.create_offer(None).await.map_err(|e| {
                TransportError::Negotiation(format!("failed to create offer: {}", e))
            })?;
            let sdp = offer.sdp.clone();
            self.peer_connection
                .set_local_description(offer)
                .await
                .map_err(|e| {
                    TransportError::Negotiation(format!("failed to set local description: {}", e))
                })?;
            Ok(sdp)
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, TransportResult<String>> {
        Box::pin(async move {
            let answer = self.peer_connection.create_answer(None).await.map_err(|e| {
                TransportError::Negotiation(format!("failed to create answer: {}", e))
            })?;
            let sdp = answer.sdp.clone();
            self.peer_connection
                .set_local_description(answer)
                .await
                .map_err(|e| {
                    TransportError::Negotiation(format!("failed to set local description: {}", e))
                })?;
            Ok(sdp)
        })
    }

    fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let description = match kind {
                SdpKind::Offer => RTCSessionDescription::offer(sdp),
                SdpKind::Answer => RTCSessionDescription::answer(sdp),
            }
            .map_err(|e| TransportError::Negotiation(format!("invalid remote SDP: {}", e)))?;

            self.peer_connection
                .set_remote_description(description)
                .await
                .map_err(|e| {
                    TransportError::Negotiation(format!("failed to set remote description: {}", e))
                })
        })
    }

    fn has_remote_description(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.peer_connection.remote_description().await.is_some() })
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| TransportError::Candidate(e.to_string()))
        })
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.peer_connection.signaling_state()).unwrap_or_default()
    }

    fn close(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.peer_connection
                .close()
                .await
                .map_err(|e| TransportError::Negotiation(format!("failed to close: {}", e)))
        })
    }
}

/// A webrtc-rs data channel.
pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
}

impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        self.channel.label()
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    fn buffered_amount(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.channel.buffered_amount().await })
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.channel
                .send_text(text)
                .await
                .map(|_| ())
                .map_err(|e| TransportError::Channel(format!("failed to send: {}", e)))
        })
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.channel
                .send(&data)
                .await
                .map(|_| ())
                .map_err(|e| TransportError::Channel(format!("failed to send: {}", e)))
        })
    }

    fn close(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.channel
                .close()
                .await
                .map_err(|e| TransportError::Channel(format!("failed to close: {}", e)))
        })
    }
}
