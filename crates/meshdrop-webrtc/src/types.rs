//! Shared types for links, transfers and session events

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use meshdrop_room::{IceCandidate, ParticipantId, RoomId};

use crate::directory::DirectoryEntry;
use crate::transfer::TransferError;

/// Fixed chunk size for file transfers (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Data channel label used for control messages and chunks
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// SCTP retransmit limit for the data channel
pub const DATA_CHANNEL_MAX_RETRANSMITS: u16 = 3;

/// Negotiation role of one side of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Greater identifier: sends the first offer and is impolite on glare
    Initiator,
    /// Lesser identifier: waits for offers and yields on glare
    Responder,
}

impl Role {
    /// Role of `local` on the link to `remote`. Both sides compute
    /// complementary roles from the same pair.
    pub fn for_pair(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local > remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn is_initiator(self) -> bool {
        self == Role::Initiator
    }

    pub fn is_polite(self) -> bool {
        self == Role::Responder
    }
}

/// Usability of the link's data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unlinked,
    Negotiating,
    Open,
    Closed,
}

/// Offer/answer state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Transport health reported by a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Transfer identifier, unique per link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Per-recipient id derived from a shared base: `<base>-<participant>`
    pub fn for_participant(&self, participant: &ParticipantId) -> Self {
        Self(format!("{}-{}", self.0, participant))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Offered,
    Accepted,
    Rejected,
    Transferring,
    Completed,
    Error,
}

impl TransferStatus {
    /// Offered, accepted or transferring
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferStatus::Offered | TransferStatus::Accepted | TransferStatus::Transferring
        )
    }
}

/// Metadata of a file another participant wants to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
}

/// A completely reassembled incoming file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Everything a session reports to its owner
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LinkOpen {
        participant: ParticipantId,
    },
    LinkClosed {
        participant: ParticipantId,
    },
    /// Must be answered with `Session::accept` or `Session::reject`
    IncomingOffer {
        participant: ParticipantId,
        offer: IncomingOffer,
    },
    Progress {
        participant: ParticipantId,
        transfer_id: TransferId,
        direction: Direction,
        bytes_moved: u64,
        file_size: u64,
    },
    TransferCompleted {
        participant: ParticipantId,
        transfer_id: TransferId,
        direction: Direction,
    },
    FileReceived {
        participant: ParticipantId,
        file: ReceivedFile,
    },
    TransferFailed {
        participant: ParticipantId,
        transfer_id: TransferId,
        direction: Direction,
        error: TransferError,
    },
    DirectoryUpdated {
        participant: ParticipantId,
        added: Vec<DirectoryEntry>,
    },
}

impl SessionEvent {
    /// Fraction in 0..=1 for progress events
    pub fn progress(&self) -> Option<f64> {
        match self {
            SessionEvent::Progress {
                bytes_moved,
                file_size,
                ..
            } => Some(if *file_size == 0 {
                1.0
            } else {
                *bytes_moved as f64 / *file_size as f64
            }),
            _ => None,
        }
    }
}

pub type SessionEventSender = tokio::sync::mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_initiator() {
        let pairs = [("a", "b"), ("zeta", "alpha"), ("p1", "p10"), ("x", "xy")];
        for (a, b) in pairs {
            let a = ParticipantId::new(a);
            let b = ParticipantId::new(b);
            let ra = Role::for_pair(&a, &b);
            let rb = Role::for_pair(&b, &a);
            assert_ne!(ra, rb);
            assert!(ra.is_initiator() ^ rb.is_initiator());
            assert!(ra.is_polite() ^ rb.is_polite());
        }
    }

    #[test]
    fn test_greater_id_initiates() {
        let hi = ParticipantId::new("b");
        let lo = ParticipantId::new("a");
        assert_eq!(Role::for_pair(&hi, &lo), Role::Initiator);
        assert_eq!(Role::for_pair(&lo, &hi), Role::Responder);
    }

    #[test]
    fn test_derived_transfer_id() {
        let base = TransferId::new("t1");
        let id = base.for_participant(&ParticipantId::new("bob"));
        assert_eq!(id.as_str(), "t1-bob");
    }
}
