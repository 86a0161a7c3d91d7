//! Mock implementations for testing and simulation
//!
//! In-memory stand-ins for the signaling relay and for WebRTC. A
//! [`MockNetwork`] pairs mock peer connections once an offer/answer
//! exchange completes and hands both sides a connected
//! [`MockDataChannel`]. State transitions follow the WebRTC signaling
//! state machine closely enough to exercise glare handling, candidate
//! queueing and link rebuilds.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::debug;

use crate::protocol::ChannelFrame;
use crate::transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, SignalingRelay, TransportError,
    TransportEvent, TransportEventSender,
};
use crate::types::{
    ConnectionState, IceCandidate, ParticipantId, SdpKind, SessionDescription, SignalingState,
    DATA_CHANNEL_LABEL,
};
use meshdrop_room::SignalMessage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Mock Relay
// ============================================================================

/// In-memory signaling relay. Messages are queued per target until the
/// test (or a forwarding task) drains the receiver.
#[derive(Default)]
pub struct MockRelay {
    routes: Mutex<HashMap<ParticipantId, mpsc::UnboundedSender<SignalMessage>>>,
    sent: AtomicUsize,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a participant; returns its sending half and its inbox
    pub fn endpoint(
        self: &Arc<Self>,
        id: ParticipantId,
    ) -> (Arc<MockRelayEndpoint>, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.routes).insert(id.clone(), tx);
        let endpoint = Arc::new(MockRelayEndpoint {
            local: id,
            relay: self.clone(),
        });
        (endpoint, rx)
    }

    pub fn detach(&self, id: &ParticipantId) {
        lock(&self.routes).remove(id);
    }

    /// Total messages routed so far
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

pub struct MockRelayEndpoint {
    local: ParticipantId,
    relay: Arc<MockRelay>,
}

#[async_trait]
impl SignalingRelay for MockRelayEndpoint {
    async fn send_signal(&self, mut msg: SignalMessage) -> Result<(), TransportError> {
        msg.from_participant = self.local.clone();
        let routes = lock(&self.relay.routes);
        let tx = routes
            .get(&msg.target_participant)
            .ok_or(TransportError::NotConnected)?;
        tx.send(msg).map_err(|_| TransportError::Disconnected)?;
        self.relay.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

/// One end of an in-memory data channel pair
///
/// Tracks bytes sent but not yet read by the peer as the buffered amount,
/// so a slow reader applies real backpressure to the sender.
pub struct MockDataChannel {
    label: String,
    tx: mpsc::UnboundedSender<ChannelFrame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelFrame>>,
    open: Arc<watch::Sender<bool>>,
    /// Our unread outbound bytes
    outbound: Arc<AtomicUsize>,
    outbound_drained: Arc<Notify>,
    /// The peer's unread outbound bytes (we drain these)
    inbound: Arc<AtomicUsize>,
    inbound_drained: Arc<Notify>,
}

fn frame_len(frame: &ChannelFrame) -> usize {
    match frame {
        ChannelFrame::Text(text) => text.len(),
        ChannelFrame::Binary(data) => data.len(),
    }
}

impl MockDataChannel {
    /// Create a connected pair of channels
    pub fn pair(label: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (open, _) = watch::channel(true);
        let open = Arc::new(open);
        let buffered_a = Arc::new(AtomicUsize::new(0));
        let buffered_b = Arc::new(AtomicUsize::new(0));
        let drained_a = Arc::new(Notify::new());
        let drained_b = Arc::new(Notify::new());

        let chan_a = Self {
            label: label.to_string(),
            tx: tx_b, // A sends to B's receiver
            rx: tokio::sync::Mutex::new(rx_a),
            open: open.clone(),
            outbound: buffered_a.clone(),
            outbound_drained: drained_a.clone(),
            inbound: buffered_b.clone(),
            inbound_drained: drained_b.clone(),
        };

        let chan_b = Self {
            label: label.to_string(),
            tx: tx_a, // B sends to A's receiver
            rx: tokio::sync::Mutex::new(rx_b),
            open,
            outbound: buffered_b,
            outbound_drained: drained_b,
            inbound: buffered_a,
            inbound_drained: drained_a,
        };

        (chan_a, chan_b)
    }

    fn push(&self, frame: ChannelFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }
        self.outbound.fetch_add(frame_len(&frame), Ordering::SeqCst);
        self.tx.send(frame).map_err(|_| TransportError::Disconnected)
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.push(ChannelFrame::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.push(ChannelFrame::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.outbound.load(Ordering::SeqCst)
    }

    async fn wait_buffered_below(&self, threshold: usize, poll: Duration) {
        loop {
            let drained = self.outbound_drained.notified();
            if !self.is_open() || self.buffered_amount().await <= threshold {
                return;
            }
            tokio::select! {
                _ = drained => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn recv(&self) -> Option<ChannelFrame> {
        let mut rx = self.rx.lock().await;
        let mut open = self.open.subscribe();
        loop {
            if !*open.borrow_and_update() {
                return None;
            }
            tokio::select! {
                frame = rx.recv() => {
                    let frame = frame?;
                    self.inbound.fetch_sub(frame_len(&frame), Ordering::SeqCst);
                    self.inbound_drained.notify_waiters();
                    return Some(frame);
                }
                changed = open.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn close(&self) {
        self.open.send_replace(false);
    }
}

// ============================================================================
// Mock Network
// ============================================================================

struct Endpoint {
    local: ParticipantId,
    remote: ParticipantId,
    events: TransportEventSender,
    /// Offer (by connection uid) this endpoint has answered
    answered: Option<u64>,
}

struct Established {
    offerer: u64,
    answerer: u64,
    channels: [Arc<MockDataChannel>; 2],
}

/// Shared medium connecting mock peer connections
#[derive(Default)]
pub struct MockNetwork {
    next_uid: AtomicU64,
    endpoints: Mutex<HashMap<u64, Endpoint>>,
    established: Mutex<Vec<Established>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(
        &self,
        local: ParticipantId,
        remote: ParticipantId,
        events: TransportEventSender,
    ) -> u64 {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.endpoints).insert(
            uid,
            Endpoint {
                local,
                remote,
                events,
                answered: None,
            },
        );
        uid
    }

    fn unregister(&self, uid: u64) {
        lock(&self.endpoints).remove(&uid);
        let mut established = lock(&self.established);
        established.retain(|link| {
            let involved = link.offerer == uid || link.answerer == uid;
            if involved {
                for channel in &link.channels {
                    channel.open.send_replace(false);
                }
            }
            !involved
        });
    }

    fn record_answer(&self, answerer: u64, offerer: u64) {
        if let Some(endpoint) = lock(&self.endpoints).get_mut(&answerer) {
            endpoint.answered = Some(offerer);
        }
    }

    /// Called when `offerer` applies the answer produced by `answerer`
    fn establish(&self, offerer: u64, answerer: u64) -> Result<(), TransportError> {
        let endpoints = lock(&self.endpoints);
        let (Some(a), Some(b)) = (endpoints.get(&offerer), endpoints.get(&answerer)) else {
            return Err(TransportError::ConnectionFailed(
                "remote connection is gone".to_string(),
            ));
        };
        if b.answered != Some(offerer) || a.remote != b.local || b.remote != a.local {
            return Err(TransportError::ConnectionFailed(
                "answer does not match the current offer".to_string(),
            ));
        }

        let (chan_a, chan_b) = MockDataChannel::pair(DATA_CHANNEL_LABEL);
        let chan_a = Arc::new(chan_a);
        let chan_b = Arc::new(chan_b);

        for (endpoint, channel) in [(a, chan_a.clone()), (b, chan_b.clone())] {
            let _ = endpoint
                .events
                .send(TransportEvent::StateChanged(ConnectionState::Connected));
            let _ = endpoint.events.send(TransportEvent::ChannelOpen(channel));
        }
        debug!("Mock link {} <-> {} established", a.local, b.local);

        lock(&self.established).push(Established {
            offerer,
            answerer,
            channels: [chan_a, chan_b],
        });
        Ok(())
    }

    /// Simulate a transport failure between two participants: channels
    /// close and both connections report `Failed`. Returns the number of
    /// links affected.
    pub fn fail_link(&self, a: &ParticipantId, b: &ParticipantId) -> usize {
        let endpoints = lock(&self.endpoints);
        let mut established = lock(&self.established);
        let mut failed = 0;
        established.retain(|link| {
            let (Some(x), Some(y)) = (endpoints.get(&link.offerer), endpoints.get(&link.answerer))
            else {
                return true;
            };
            let matches = (&x.local == a && &y.local == b) || (&x.local == b && &y.local == a);
            if matches {
                for channel in &link.channels {
                    channel.open.send_replace(false);
                }
                for endpoint in [x, y] {
                    let _ = endpoint
                        .events
                        .send(TransportEvent::StateChanged(ConnectionState::Failed));
                }
                failed += 1;
            }
            !matches
        });
        failed
    }

    /// Number of currently established links
    pub fn link_count(&self) -> usize {
        lock(&self.established).len()
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

struct PcState {
    signaling: SignalingState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    channel_label: Option<String>,
    candidates_emitted: u32,
}

pub struct MockPeerConnection {
    uid: u64,
    remote: ParticipantId,
    network: Arc<MockNetwork>,
    events: TransportEventSender,
    state: Mutex<PcState>,
}

fn sdp_uid(sdp: &str) -> Option<u64> {
    sdp.split_whitespace().last()?.parse().ok()
}

impl MockPeerConnection {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Remote candidates applied so far
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).applied_candidates.clone()
    }

    pub fn data_channel_label(&self) -> Option<String> {
        lock(&self.state).channel_label.clone()
    }

    fn emit_candidate(&self) {
        let seq = {
            let mut state = lock(&self.state);
            state.candidates_emitted += 1;
            state.candidates_emitted
        };
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.uid,
                50000 + seq
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
    }

    fn invalid(&self, what: &str, state: SignalingState) -> TransportError {
        TransportError::InvalidState(format!("{} in {:?}", what, state))
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.signaling_state();
        match state {
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                Ok(SessionDescription::offer(format!("mock-offer {}", self.uid)))
            }
            _ => Err(self.invalid("create_offer", state)),
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let state = self.signaling_state();
        match state {
            SignalingState::HaveRemoteOffer => {
                Ok(SessionDescription::answer(format!("mock-answer {}", self.uid)))
            }
            _ => Err(self.invalid("create_answer", state)),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let answered_offer = {
            let mut state = lock(&self.state);
            let next = match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, current) => return Err(self.invalid("set_local_description", current)),
            };
            state.signaling = next;
            let answered = match desc.kind {
                SdpKind::Answer => state
                    .remote_description
                    .as_ref()
                    .and_then(|d| sdp_uid(&d.sdp)),
                SdpKind::Offer => None,
            };
            state.local_description = Some(desc);
            answered
        };

        if let Some(offerer) = answered_offer {
            self.network.record_answer(self.uid, offerer);
        }
        self.emit_candidate();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let answerer = {
            let mut state = lock(&self.state);
            let next = match (desc.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, current) => return Err(self.invalid("set_remote_description", current)),
            };
            let answerer = match desc.kind {
                SdpKind::Answer => Some(sdp_uid(&desc.sdp).ok_or_else(|| {
                    TransportError::InvalidState("malformed answer".to_string())
                })?),
                SdpKind::Offer => None,
            };
            state.signaling = next;
            state.remote_description = Some(desc);
            answerer
        };

        if let Some(answerer) = answerer {
            self.network.establish(self.uid, answerer)?;
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.state).remote_description.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.remote_description.is_none() {
            return Err(TransportError::InvalidState(
                "candidate before remote description".to_string(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        lock(&self.state).channel_label = Some(label.to_string());
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.signaling == SignalingState::HaveLocalOffer {
            state.signaling = SignalingState::Stable;
            state.local_description = None;
        }
        Ok(())
    }

    async fn close(&self) {
        lock(&self.state).signaling = SignalingState::Closed;
        self.network.unregister(self.uid);
    }
}

// ============================================================================
// Mock Peer Connection Factory
// ============================================================================

/// Per-participant factory creating [`MockPeerConnection`]s on a shared
/// [`MockNetwork`]. Keeps every connection it created for inspection.
pub struct MockConnectionFactory {
    local: ParticipantId,
    network: Arc<MockNetwork>,
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockConnectionFactory {
    pub fn new(network: Arc<MockNetwork>, local: ParticipantId) -> Self {
        Self {
            local,
            network,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Connections created towards `remote`, oldest first
    pub fn connections_to(&self, remote: &ParticipantId) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.created)
            .iter()
            .filter(|c| &c.remote == remote)
            .cloned()
            .collect()
    }

    pub fn created_count(&self) -> usize {
        lock(&self.created).len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let uid = self
            .network
            .register(self.local.clone(), remote.clone(), events.clone());
        let connection = Arc::new(MockPeerConnection {
            uid,
            remote: remote.clone(),
            network: self.network.clone(),
            events,
            state: Mutex::new(PcState {
                signaling: SignalingState::Stable,
                local_description: None,
                remote_description: None,
                applied_candidates: Vec::new(),
                channel_label: None,
                candidates_emitted: 0,
            }),
        });
        lock(&self.created).push(connection.clone());
        Ok(connection)
    }
}
