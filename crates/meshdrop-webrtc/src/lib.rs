//! Peer links and chunked file transfer for meshdrop rooms
//!
//! Every pair of participants in a room negotiates a direct WebRTC data
//! channel through the signaling relay, then exchanges files over it.
//!
//! # Overview
//!
//! - **Negotiation**: perfect negotiation with polite/impolite roles,
//!   candidate queueing and automatic rebuild of failed links
//! - **Transfer**: 64 KiB chunks, explicit accept/reject, backpressure on
//!   the channel's buffered amount
//! - **Directory**: file catalogues gossiped when a link opens
//!
//! # Example
//!
//! ```rust,no_run
//! use meshdrop_webrtc::{RealPeerConnectionFactory, RelayClient, Session, SessionConfig};
//! use meshdrop_room::{RelayEvent, RoomId};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (relay, mut relay_events) = RelayClient::connect("ws://127.0.0.1:3001/ws").await?;
//!     relay.join_room(RoomId::new("A1B2C3"), None)?;
//!
//!     let (session, _events) = Session::new(
//!         relay.id().clone(),
//!         RoomId::new("A1B2C3"),
//!         Arc::new(RealPeerConnectionFactory::default()),
//!         relay.clone(),
//!         SessionConfig::default(),
//!     );
//!     while let Some(event) = relay_events.recv().await {
//!         session.handle_relay_event(event).await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod directory;
pub mod link;
pub mod mock;
pub mod negotiator;
pub mod protocol;
pub mod real_factory;
pub mod relay_client;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod types;

pub use directory::{DirectoryEntry, FileDirectory, DEDUP_BUCKET_MS};
pub use link::PeerLink;
pub use negotiator::{LinkEvent, LinkNegotiator, NegotiationError, NegotiatorConfig};
pub use protocol::{assemble, split_chunks, total_chunks, ChannelFrame, ControlMessage, ProtocolError};
pub use real_factory::{RealPeerConnection, RealPeerConnectionFactory};
pub use relay_client::{RelayClient, RelayClientError};
pub use session::{Session, SessionConfig};
pub use transfer::{OutgoingFile, TransferConfig, TransferEngine, TransferError};
pub use transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, SignalingRelay, TransportError,
    TransportEvent,
};
pub use types::{
    ChannelState, ConnectionState, Direction, IceCandidate, IncomingOffer, ParticipantId,
    ReceivedFile, Role, RoomId, SessionDescription, SessionEvent, SessionEventReceiver,
    SignalingState, TransferId, TransferStatus, CHUNK_SIZE, DATA_CHANNEL_LABEL,
};
