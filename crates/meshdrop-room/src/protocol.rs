//! Relay wire protocol
//!
//! JSON text frames exchanged between participants and the signaling relay.
//! Every frame is an object with a `type` discriminator:
//!
//! - client -> relay: [`RelayRequest`]
//! - relay -> client: [`RelayEvent`]
//!
//! Negotiation traffic (`offer`, `answer`, `ice-candidate`) travels as a
//! [`SignalMessage`] wrapped in the `signal` variant of both enums. The relay
//! forwards it to `targetParticipant` and stamps `fromParticipant` itself.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::registry::AdmissionError;

/// Opaque participant identifier assigned by the relay on connect
///
/// Ordering is lexicographic on the underlying string; link roles are
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines: the first eight characters
    pub fn short(&self) -> &str {
        self.0
            .char_indices()
            .nth(8)
            .map_or(self.0.as_str(), |(end, _)| &self.0[..end])
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Six character uppercase hex room identifier
///
/// Deserialization goes through [`RoomId::new`], so ids typed in lowercase
/// still find their room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct RoomId(String);

/// Number of random bytes behind a room id (two hex digits each)
const ROOM_ID_BYTES: usize = 3;

impl RoomId {
    /// Normalizes user input to the canonical uppercase form
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_uppercase())
    }

    /// Random id from the operating system CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A participant as seen by other room members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ParticipantId,
    pub name: String,
}

/// ICE candidate for WebRTC connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Negotiation payload relayed between two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Directed signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub from_participant: ParticipantId,
    pub target_participant: ParticipantId,
    pub room_id: RoomId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalMessage {
    pub fn new(
        from: ParticipantId,
        target: ParticipantId,
        room_id: RoomId,
        payload: SignalPayload,
    ) -> Self {
        Self {
            from_participant: from,
            target_participant: target,
            room_id,
            payload,
        }
    }

    pub fn is_for(&self, participant: &ParticipantId) -> bool {
        &self.target_participant == participant
    }
}

/// Requests a participant sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayRequest {
    CreateRoom {
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        password: Option<String>,
    },
    LeaveRoom,
    #[serde(rename_all = "camelCase")]
    ChangeName { new_name: String },
    Signal { message: SignalMessage },
}

/// Events the relay pushes to a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// First frame on every connection
    Welcome { identity: Identity },
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_id: RoomId,
        identity: Identity,
        has_password: bool,
    },
    /// `participants` lists the other members, never the joiner
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: RoomId,
        identity: Identity,
        participants: Vec<Identity>,
    },
    RoomError {
        reason: AdmissionError,
        message: String,
    },
    ParticipantJoined { id: ParticipantId, name: String },
    ParticipantLeft { id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    ParticipantRenamed {
        id: ParticipantId,
        old_name: String,
        new_name: String,
    },
    #[serde(rename_all = "camelCase")]
    NameChanged { new_name: String },
    Signal { message: SignalMessage },
    /// Malformed or unauthorized request
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_format() {
        for _ in 0..50 {
            let id = RoomId::generate();
            assert_eq!(id.as_str().len(), 6);
            assert!(id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }
    }

    #[test]
    fn test_room_id_normalizes_input() {
        assert_eq!(RoomId::new(" a1b2c3 ").as_str(), "A1B2C3");
    }

    #[test]
    fn test_room_id_wire_form() {
        let id: RoomId = serde_json::from_str(r#"" ab12cd""#).unwrap();
        assert_eq!(id.as_str(), "AB12CD");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""AB12CD""#);
    }

    #[test]
    fn test_short_id_counts_characters() {
        assert_eq!(ParticipantId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(ParticipantId::new("abc").short(), "abc");
        assert_eq!(ParticipantId::new("aéééé").short(), "aéééé");
        assert_eq!(ParticipantId::new("ééééééééé").short(), "éééééééé");
        assert_eq!(ParticipantId::new("").short(), "");
    }

    #[test]
    fn test_signal_message_wire_shape() {
        let msg = SignalMessage::new(
            "alice".into(),
            "bob".into(),
            RoomId::new("ABC123"),
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["fromParticipant"], "alice");
        assert_eq!(json["targetParticipant"], "bob");
        assert_eq!(json["roomId"], "ABC123");
        assert_eq!(json["sdp"], "v=0");
    }

    #[test]
    fn test_parse_ice_candidate_signal() {
        let json = r#"{
            "type": "ice-candidate",
            "fromParticipant": "a",
            "targetParticipant": "b",
            "roomId": "FFFFFF",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        match msg.payload {
            SignalPayload::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_parse_join_request() {
        let req: RelayRequest =
            serde_json::from_str(r#"{"type":"join-room","roomId":"ab12cd","password":"secret"}"#)
                .unwrap();
        assert_eq!(
            req,
            RelayRequest::JoinRoom {
                room_id: RoomId::new("AB12CD"),
                password: Some("secret".to_string()),
            }
        );

        let req: RelayRequest = serde_json::from_str(r#"{"type":"create-room"}"#).unwrap();
        assert_eq!(req, RelayRequest::CreateRoom { password: None });
    }

    #[test]
    fn test_room_error_serializes_reason() {
        let event = RelayEvent::RoomError {
            reason: AdmissionError::Full,
            message: AdmissionError::Full.to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "room-error");
        assert_eq!(json["reason"], "full");
        assert_eq!(json["message"], "Room is full");
    }
}
