//! Transport abstraction
//!
//! Defines traits for the signaling relay, peer connections and data
//! channels so negotiation and transfer logic can run over either real
//! WebRTC or the in-memory mocks.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ChannelFrame;
use crate::types::{
    ConnectionState, IceCandidate, ParticipantId, SessionDescription, SignalingState,
};
use meshdrop_room::SignalMessage;

/// Errors from transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// Asynchronous notifications from a peer connection
pub enum TransportEvent {
    /// Locally gathered ICE candidate to forward to the remote side
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// The data channel is open and ready for traffic
    ChannelOpen(Arc<dyn DataChannel>),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Outbound half of the signaling relay
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Deliver a message to `msg.target_participant`
    async fn send_signal(&self, msg: SignalMessage) -> Result<(), TransportError>;
}

/// One side of a WebRTC-style peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn has_remote_description(&self) -> bool;

    /// Fails if no remote description has been applied yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Create the outbound data channel. The opened channel arrives later
    /// as [`TransportEvent::ChannelOpen`] on both sides.
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;

    /// Discard an unanswered local offer and return to stable
    async fn rollback(&self) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Creates peer connections wired to an event sink
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        remote: &ParticipantId,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

/// Whether two handles refer to the same channel
pub(crate) fn same_channel(a: &Arc<dyn DataChannel>, b: &Arc<dyn DataChannel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Ordered, reliable message channel between two participants
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    /// Suspend until at most `threshold` bytes are buffered or the channel
    /// closes. The default polls every `poll`; implementations with a
    /// buffered-amount-low signal should wake on it instead.
    async fn wait_buffered_below(&self, threshold: usize, poll: Duration) {
        while self.is_open() && self.buffered_amount().await > threshold {
            tokio::time::sleep(poll).await;
        }
    }

    /// Next frame, or `None` once the channel is closed
    async fn recv(&self) -> Option<ChannelFrame>;

    fn is_open(&self) -> bool;

    fn label(&self) -> &str;

    async fn close(&self);
}
