//! Real WebRTC peer connection factory
//!
//! Wraps the webrtc crate behind the transport traits. Callbacks registered
//! on the peer connection and data channel feed [`TransportEvent`]s and
//! inbound frames into channels, so the negotiator never sees webrtc types.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::protocol::ChannelFrame;
use crate::transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, TransportError, TransportEvent,
    TransportEventSender,
};
use crate::types::{
    ConnectionState, IceCandidate, ParticipantId, SdpKind, SessionDescription, SignalingState,
    DATA_CHANNEL_LABEL, DATA_CHANNEL_MAX_RETRANSMITS,
};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Data channel backed by an `RTCDataChannel`
struct RealDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelFrame>>,
    /// Signalled by the buffered-amount-low callback
    drained: Arc<Notify>,
}

impl RealDataChannel {
    /// Register callbacks on `dc`. [`TransportEvent::ChannelOpen`] is sent
    /// exactly once, when the channel opens.
    async fn wire(dc: Arc<RTCDataChannel>, events: TransportEventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let drained = Arc::new(Notify::new());
        let channel = Arc::new(Self {
            dc: dc.clone(),
            label: dc.label().to_string(),
            rx: tokio::sync::Mutex::new(rx),
            drained: drained.clone(),
        });

        dc.on_buffered_amount_low(Box::new(move || {
            let drained = drained.clone();
            Box::pin(async move {
                drained.notify_waiters();
            })
        }))
        .await;

        let message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                ChannelFrame::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelFrame::Binary(msg.data)
            };
            if let Some(tx) = lock(&message_tx).as_ref() {
                let _ = tx.send(frame);
            }
            Box::pin(async {})
        }));

        let close_tx = tx;
        let label = channel.label.clone();
        dc.on_close(Box::new(move || {
            debug!("Data channel '{}' closed", label);
            lock(&close_tx).take();
            Box::pin(async {})
        }));

        // Handed out once, by whichever of on_open or the check below wins
        let pending: Arc<Mutex<Option<Arc<RealDataChannel>>>> =
            Arc::new(Mutex::new(Some(channel)));
        let announce = move |pending: &Mutex<Option<Arc<RealDataChannel>>>,
                             events: &TransportEventSender| {
            if let Some(channel) = lock(pending).take() {
                let _ = events.send(TransportEvent::ChannelOpen(channel));
            }
        };

        let open_pending = pending.clone();
        let open_events = events.clone();
        dc.on_open(Box::new(move || {
            announce(&open_pending, &open_events);
            Box::pin(async {})
        }));
        if dc.ready_state() == RTCDataChannelState::Open {
            announce(&pending, &events);
        }
    }
}

#[async_trait]
impl DataChannel for RealDataChannel {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn wait_buffered_below(&self, threshold: usize, poll: Duration) {
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        while self.is_open() && self.dc.buffered_amount().await > threshold {
            // The poll bounds a wakeup missed between the check and the wait
            let _ = tokio::time::timeout(poll, self.drained.notified()).await;
        }
    }

    async fn recv(&self) -> Option<ChannelFrame> {
        self.rx.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!("Data channel close: {}", e);
        }
    }
}

/// Peer connection backed by an `RTCPeerConnection`
pub struct RealPeerConnection {
    connection: Arc<RTCPeerConnection>,
    events: TransportEventSender,
}

impl RealPeerConnection {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(failed)
    }

    fn setup_handlers(&self) {
        let events = self.events.clone();
        self.connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                let _ = events.send(TransportEvent::StateChanged(state));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_m_line_index: json.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            Box::pin(async move {
                if dc.label() == DATA_CHANNEL_LABEL {
                    RealDataChannel::wire(dc, events).await;
                } else {
                    debug!("Ignoring data channel '{}'", dc.label());
                }
            })
        }));
    }
}

#[async_trait]
impl PeerConnection for RealPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        match self.connection.signaling_state() {
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.connection.create_offer(None).await.map_err(failed)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.connection.create_answer(None).await.map_err(failed)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.connection
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(failed)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.connection
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(failed)
    }

    async fn has_remote_description(&self) -> bool {
        self.connection.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.connection.add_ice_candidate(init).await.map_err(failed)
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            max_retransmits: Some(DATA_CHANNEL_MAX_RETRANSMITS),
            ..Default::default()
        };
        let dc = self
            .connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(failed)?;
        RealDataChannel::wire(dc, self.events.clone()).await;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        if self.signaling_state() != SignalingState::HaveLocalOffer {
            return Ok(());
        }
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(failed)?;
        self.connection
            .set_local_description(rollback)
            .await
            .map_err(failed)
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!("Peer connection close: {}", e);
        }
    }
}

/// Creates [`RealPeerConnection`]s using the configured STUN servers
pub struct RealPeerConnectionFactory {
    stun_servers: Vec<String>,
}

impl RealPeerConnectionFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(failed)
    }
}

impl Default for RealPeerConnectionFactory {
    fn default() -> Self {
        Self::new(
            meshdrop_config::DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

#[async_trait]
impl PeerConnectionFactory for RealPeerConnectionFactory {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let connection = RealPeerConnection {
            connection: self.new_connection().await?,
            events,
        };
        connection.setup_handlers();
        debug!("Created peer connection to {}", remote.short());
        Ok(Arc::new(connection))
    }
}
