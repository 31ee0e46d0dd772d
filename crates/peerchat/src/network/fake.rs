//! Scripted transport used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use protocol::signaling::{IceCandidate, SignalEnvelope, SignalMessage};
use tokio::sync::mpsc;

use super::signaling::{ConnectionState, SignalingClient, SignalingError, SignalingEvent};
use super::{
    BoxFuture, ChannelMessage, DataChannel, EventSink, PeerTransport, SdpKind, TransportError,
    TransportFactory, TransportResult,
};
use crate::session::state::SignalingState;

pub(crate) struct FakeChannel {
    label: String,
    pub open: AtomicBool,
    pub buffered: AtomicUsize,
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<ChannelMessage>>,
}

impl FakeChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::Text(t) => Some(t.clone()),
                ChannelMessage::Binary(_) => None,
            })
            .collect()
    }

    pub fn sent_binaries(&self) -> Vec<Bytes> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::Binary(b) => Some(b.clone()),
                ChannelMessage::Text(_) => None,
            })
            .collect()
    }
}

impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.buffered.load(Ordering::SeqCst) })
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(ChannelMessage::Text(text));
            Ok(())
        })
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(ChannelMessage::Binary(data));
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.open.store(false, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

pub(crate) struct FakeTransport {
    pub sink: EventSink,
    pub remote: Mutex<Option<(SdpKind, String)>>,
    pub added: Mutex<Vec<IceCandidate>>,
    pub closed: AtomicBool,
    pub signaling: Mutex<SignalingState>,
    pub channels: Mutex<Vec<Arc<FakeChannel>>>,
    pub fail_remote: AtomicBool,
}

impl FakeTransport {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            remote: Mutex::new(None),
            added: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            signaling: Mutex::new(SignalingState::Stable),
            channels: Mutex::new(Vec::new()),
            fail_remote: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.added
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn channel(&self) -> Option<Arc<FakeChannel>> {
        self.channels.lock().unwrap().first().cloned()
    }
}

impl PeerTransport for FakeTransport {
    fn create_data_channel<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, TransportResult<Arc<dyn DataChannel>>> {
        Box::pin(async move {
            let channel = Arc::new(FakeChannel::new(label));
            self.channels.lock().unwrap().push(channel.clone());
            Ok(channel as Arc<dyn DataChannel>)
        })
    }

    fn create_offer(&self) -> BoxFuture<'_, TransportResult<String>> {
        Box::pin(async move {
            *self.signaling.lock().unwrap() = SignalingState::HaveLocalOffer;
            Ok("fake-offer".to_string())
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, TransportResult<String>> {
        Box::pin(async move {
            *self.signaling.lock().unwrap() = SignalingState::Stable;
            Ok("fake-answer".to_string())
        })
    }

    fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.fail_remote.load(Ordering::SeqCst) {
                return Err(TransportError::Negotiation("scripted failure".to_string()));
            }
            *self.signaling.lock().unwrap() = match kind {
                SdpKind::Offer => SignalingState::HaveRemoteOffer,
                SdpKind::Answer => SignalingState::Stable,
            };
            *self.remote.lock().unwrap() = Some((kind, sdp));
            Ok(())
        })
    }

    fn has_remote_description(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.remote.lock().unwrap().is_some() })
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.remote.lock().unwrap().is_none() {
                return Err(TransportError::Candidate(
                    "remote description not set".to_string(),
                ));
            }
            self.added.lock().unwrap().push(candidate);
            Ok(())
        })
    }

    fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock().unwrap()
    }

    fn close(&self) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            *self.signaling.lock().unwrap() = SignalingState::Closed;
            for channel in self.channels.lock().unwrap().iter() {
                channel.set_open(false);
            }
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeFactory {
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub fail: AtomicBool,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.transports.lock().unwrap().last().cloned().unwrap()
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, sink: EventSink) -> BoxFuture<'_, TransportResult<Arc<dyn PeerTransport>>> {
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Creation("scripted failure".to_string()));
            }
            let transport = Arc::new(FakeTransport::new(sink));
            self.transports.lock().unwrap().push(transport.clone());
            Ok(transport as Arc<dyn PeerTransport>)
        })
    }
}

pub(crate) fn candidate(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Signaling client that records what is sent and lets a test inject events.
pub(crate) struct FakeSignaling {
    pub sent: Mutex<Vec<SignalMessage>>,
    pub connected: AtomicBool,
    events_tx: mpsc::Sender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SignalingEvent>>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliver `message` as if the relay forwarded it from `from`.
    pub async fn inject(&self, from: &str, message: SignalMessage) {
        let envelope = message.into_envelope(Some(from.to_string())).unwrap();
        self.inject_envelope(envelope).await;
    }

    pub async fn inject_envelope(&self, envelope: SignalEnvelope) {
        self.events_tx
            .send(SignalingEvent::Message(envelope))
            .await
            .unwrap();
    }

    pub async fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.events_tx
            .send(SignalingEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await
            .unwrap();
    }
}

impl SignalingClient for FakeSignaling {
    fn connect<'a>(&'a self, _local_id: &'a str) -> BoxFuture<'a, Result<(), SignalingError>> {
        Box::pin(async move {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn send(&self, message: SignalMessage) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(SignalingError::NotConnected);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), SignalingError>> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn events(&self) -> Option<mpsc::Receiver<SignalingEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}
