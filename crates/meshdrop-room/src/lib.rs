//! Room registry and signaling relay
//!
//! Rooms group participants that should link up with each other. The
//! [`RoomRegistry`] decides who may enter, the [`RelayServer`] carries
//! negotiation messages between members of the same room.

pub mod names;
pub mod protocol;
pub mod registry;
pub mod server;

pub use protocol::{
    IceCandidate, Identity, ParticipantId, RelayEvent, RelayRequest, RoomId, SignalMessage,
    SignalPayload,
};
pub use registry::{
    Admission, AdmissionError, Notification, RegistryConfig, RoomInfo, RoomRegistry,
};
pub use server::{RelayServer, RelayState};
