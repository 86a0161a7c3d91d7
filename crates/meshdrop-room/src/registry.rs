//! Room registry
//!
//! Owns every room and every connected participant. All mutation goes
//! through `&mut self` methods that run to completion, so membership changes
//! are atomic with respect to each other. Methods that affect other
//! participants return the [`Notification`]s the caller must deliver.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::names::random_name;
use crate::protocol::{Identity, ParticipantId, RelayEvent, RoomId};

/// Reasons a participant can be refused entry to a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionError {
    #[error("Room not found")]
    NotFound,
    #[error("Invalid password")]
    BadPassword,
    #[error("Room is full")]
    Full,
}

/// Registry limits
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum participants per room
    pub max_room_size: usize,
    /// Rooms untouched for this long are dropped by [`RoomRegistry::sweep`]
    pub room_idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_room_size: 10,
            room_idle_timeout: Duration::from_secs(24 * 3600),
        }
    }
}

impl From<&meshdrop_config::RelayConfig> for RegistryConfig {
    fn from(config: &meshdrop_config::RelayConfig) -> Self {
        Self {
            max_room_size: config.max_room_size,
            room_idle_timeout: Duration::from_secs(config.room_idle_timeout_secs),
        }
    }
}

/// An event addressed to one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: ParticipantId,
    pub event: RelayEvent,
}

impl Notification {
    fn new(to: ParticipantId, event: RelayEvent) -> Self {
        Self { to, event }
    }
}

/// Result of a successful create or join
#[derive(Debug, Clone)]
pub struct Admission {
    pub room_id: RoomId,
    pub identity: Identity,
    /// Other members of the room, excluding the caller
    pub participants: Vec<Identity>,
    pub has_password: bool,
    /// Events for other participants (the room being joined and any room left)
    pub notifications: Vec<Notification>,
}

/// Public summary of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub user_count: usize,
    pub has_password: bool,
    pub max_users: usize,
}

struct Room {
    password_hash: Option<String>,
    /// Members in join order
    members: Vec<ParticipantId>,
    created_at: Instant,
    last_access: Instant,
}

impl Room {
    fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|m| m == id)
    }
}

struct Participant {
    name: String,
    room: Option<RoomId>,
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Empty strings count as "no password"
fn normalize_password(password: Option<&str>) -> Option<&str> {
    password.filter(|p| !p.is_empty())
}

pub struct RoomRegistry {
    config: RegistryConfig,
    rooms: HashMap<RoomId, Room>,
    participants: HashMap<ParticipantId, Participant>,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            rooms: HashMap::new(),
            participants: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a connected participant and give it a display name.
    /// Reconnecting an already known id keeps the existing name.
    pub fn connect(&mut self, id: ParticipantId) -> Identity {
        let participant = self.participants.entry(id.clone()).or_insert_with(|| {
            let name = random_name(&mut rand::thread_rng());
            debug!("Participant {} connected as {}", id.short(), name);
            Participant { name, room: None }
        });
        Identity {
            id,
            name: participant.name.clone(),
        }
    }

    /// Forget a participant, leaving its room first
    pub fn disconnect(&mut self, id: &ParticipantId) -> Vec<Notification> {
        let notifications = self.leave_current(id);
        self.participants.remove(id);
        notifications
    }

    pub fn identity(&self, id: &ParticipantId) -> Option<Identity> {
        self.participants.get(id).map(|p| Identity {
            id: id.clone(),
            name: p.name.clone(),
        })
    }

    /// Create a room with `creator` as its only member
    pub fn create_room(&mut self, creator: &ParticipantId, password: Option<&str>) -> Admission {
        let identity = self.connect(creator.clone());
        let notifications = self.leave_current(creator);

        let mut room_id = RoomId::generate();
        while self.rooms.contains_key(&room_id) {
            debug!("Room id {} collided, regenerating", room_id);
            room_id = RoomId::generate();
        }

        let password_hash = normalize_password(password).map(hash_password);
        let has_password = password_hash.is_some();
        let now = Instant::now();
        self.rooms.insert(
            room_id.clone(),
            Room {
                password_hash,
                members: vec![creator.clone()],
                created_at: now,
                last_access: now,
            },
        );
        if let Some(p) = self.participants.get_mut(creator) {
            p.room = Some(room_id.clone());
        }

        info!(
            "Room {} created by {} (password: {})",
            room_id,
            creator.short(),
            has_password
        );

        Admission {
            room_id,
            identity,
            participants: Vec::new(),
            has_password,
            notifications,
        }
    }

    /// Admit `participant` into `room_id`.
    ///
    /// Checks run in order: existence, capacity, password. A participant
    /// already in another room leaves it first; joining the room one is
    /// already in just returns the roster again.
    pub fn join_room(
        &mut self,
        participant: &ParticipantId,
        room_id: &RoomId,
        password: Option<&str>,
    ) -> Result<Admission, AdmissionError> {
        let max_room_size = self.config.max_room_size;
        let room = self.rooms.get(room_id).ok_or(AdmissionError::NotFound)?;
        let already_member = room.contains(participant);

        if !already_member {
            if room.members.len() >= max_room_size {
                return Err(AdmissionError::Full);
            }
            if let Some(expected) = &room.password_hash {
                let given = normalize_password(password).map(hash_password);
                if given.as_deref() != Some(expected.as_str()) {
                    return Err(AdmissionError::BadPassword);
                }
            }
        }

        let identity = self.connect(participant.clone());
        let mut notifications = Vec::new();
        if !already_member {
            notifications.extend(self.leave_current(participant));
        }

        let room = self.rooms.get_mut(room_id).ok_or(AdmissionError::NotFound)?;
        room.last_access = Instant::now();
        let has_password = room.password_hash.is_some();
        let others: Vec<ParticipantId> = room
            .members
            .iter()
            .filter(|m| *m != participant)
            .cloned()
            .collect();

        if !already_member {
            room.members.push(participant.clone());
            for other in &others {
                notifications.push(Notification::new(
                    other.clone(),
                    RelayEvent::ParticipantJoined {
                        id: identity.id.clone(),
                        name: identity.name.clone(),
                    },
                ));
            }
            info!(
                "{} joined room {} ({} members)",
                participant.short(),
                room_id,
                room.members.len()
            );
        }

        if let Some(p) = self.participants.get_mut(participant) {
            p.room = Some(room_id.clone());
        }

        let participants = others
            .iter()
            .filter_map(|id| self.identity(id))
            .collect();

        Ok(Admission {
            room_id: room_id.clone(),
            identity,
            participants,
            has_password,
            notifications,
        })
    }

    /// Remove `participant` from `room_id`; the room is deleted once empty
    pub fn leave_room(&mut self, room_id: &RoomId, participant: &ParticipantId) -> Vec<Notification> {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        let Some(pos) = room.members.iter().position(|m| m == participant) else {
            return Vec::new();
        };
        room.members.remove(pos);
        room.last_access = Instant::now();

        let notifications = room
            .members
            .iter()
            .map(|m| {
                Notification::new(
                    m.clone(),
                    RelayEvent::ParticipantLeft {
                        id: participant.clone(),
                    },
                )
            })
            .collect();

        if room.members.is_empty() {
            self.rooms.remove(room_id);
            info!("Room {} deleted (empty)", room_id);
        } else {
            debug!("{} left room {}", participant.short(), room_id);
        }

        if let Some(p) = self.participants.get_mut(participant) {
            if p.room.as_ref() == Some(room_id) {
                p.room = None;
            }
        }

        notifications
    }

    /// Leave whatever room the participant is currently in
    pub fn leave_current(&mut self, participant: &ParticipantId) -> Vec<Notification> {
        match self.room_of(participant).cloned() {
            Some(room_id) => self.leave_room(&room_id, participant),
            None => Vec::new(),
        }
    }

    /// Change a display name. Returns the confirmation for the caller and
    /// the broadcast for the rest of its room. Blank names are ignored.
    pub fn rename(&mut self, participant: &ParticipantId, new_name: &str) -> Vec<Notification> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Vec::new();
        }
        let Some(p) = self.participants.get_mut(participant) else {
            return Vec::new();
        };
        let old_name = std::mem::replace(&mut p.name, new_name.to_string());
        let room_id = p.room.clone();

        let mut notifications = vec![Notification::new(
            participant.clone(),
            RelayEvent::NameChanged {
                new_name: new_name.to_string(),
            },
        )];

        if let Some(room) = room_id.as_ref().and_then(|r| self.rooms.get(r)) {
            for member in room.members.iter().filter(|m| *m != participant) {
                notifications.push(Notification::new(
                    member.clone(),
                    RelayEvent::ParticipantRenamed {
                        id: participant.clone(),
                        old_name: old_name.clone(),
                        new_name: new_name.to_string(),
                    },
                ));
            }
        }

        debug!("{} renamed {} -> {}", participant.short(), old_name, new_name);
        notifications
    }

    pub fn room_of(&self, participant: &ParticipantId) -> Option<&RoomId> {
        self.participants.get(participant)?.room.as_ref()
    }

    /// True when both participants are members of the same room
    pub fn shares_room(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        match (self.room_of(a), self.room_of(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    /// Current members of a room in join order
    pub fn members(&self, room_id: &RoomId) -> Vec<Identity> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.members
                    .iter()
                    .filter_map(|id| self.identity(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_info(&self, room_id: &RoomId) -> Option<RoomInfo> {
        self.rooms.get(room_id).map(|room| RoomInfo {
            room_id: room_id.clone(),
            user_count: room.members.len(),
            has_password: room.password_hash.is_some(),
            max_users: self.config.max_room_size,
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Drop rooms that are empty, or memberless and idle past the timeout.
    /// Returns the removed ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<RoomId> {
        let idle = self.config.room_idle_timeout;
        let stale: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, room)| {
                room.members.is_empty()
                    || (now.saturating_duration_since(room.last_access) >= idle
                        && room
                            .members
                            .iter()
                            .all(|m| !self.participants.contains_key(m)))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(room) = self.rooms.remove(id) {
                info!(
                    "Swept room {} (age {:?})",
                    id,
                    now.saturating_duration_since(room.created_at)
                );
            }
        }
        stale
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn registry_with_capacity(max_room_size: usize) -> RoomRegistry {
        RoomRegistry::new(RegistryConfig {
            max_room_size,
            ..Default::default()
        })
    }

    #[test]
    fn test_create_room_adds_creator() {
        let mut reg = RoomRegistry::default();
        let admission = reg.create_room(&pid("alice"), None);
        assert_eq!(admission.room_id.as_str().len(), 6);
        assert!(admission.participants.is_empty());
        assert!(!admission.has_password);
        assert_eq!(reg.room_of(&pid("alice")), Some(&admission.room_id));
        assert_eq!(reg.members(&admission.room_id).len(), 1);
    }

    #[test]
    fn test_password_is_hashed() {
        let mut reg = RoomRegistry::default();
        let room = reg.create_room(&pid("alice"), Some("secret")).room_id;
        let stored = reg.rooms[&room].password_hash.clone().unwrap();
        assert_ne!(stored, "secret");
        assert_eq!(stored.len(), 64);
    }

    #[test]
    fn test_password_scenario() {
        let mut reg = RoomRegistry::default();
        let room = reg.create_room(&pid("alice"), Some("secret")).room_id;

        let err = reg.join_room(&pid("bob"), &room, Some("wrong")).unwrap_err();
        assert_eq!(err, AdmissionError::BadPassword);
        let err = reg.join_room(&pid("bob"), &room, None).unwrap_err();
        assert_eq!(err, AdmissionError::BadPassword);

        let admission = reg.join_room(&pid("bob"), &room, Some("secret")).unwrap();
        assert_eq!(admission.participants.len(), 1);
        assert_eq!(admission.participants[0].id, pid("alice"));
        assert!(admission.has_password);
    }

    #[test]
    fn test_join_missing_room() {
        let mut reg = RoomRegistry::default();
        let err = reg
            .join_room(&pid("bob"), &RoomId::new("000000"), None)
            .unwrap_err();
        assert_eq!(err, AdmissionError::NotFound);
        assert_eq!(err.to_string(), "Room not found");
    }

    #[test]
    fn test_capacity_rejects_regardless_of_password() {
        let mut reg = registry_with_capacity(3);
        let room = reg.create_room(&pid("p0"), Some("secret")).room_id;
        reg.join_room(&pid("p1"), &room, Some("secret")).unwrap();
        reg.join_room(&pid("p2"), &room, Some("secret")).unwrap();

        assert_eq!(
            reg.join_room(&pid("p3"), &room, Some("secret")).unwrap_err(),
            AdmissionError::Full
        );
        assert_eq!(
            reg.join_room(&pid("p3"), &room, Some("wrong")).unwrap_err(),
            AdmissionError::Full
        );
        assert_eq!(reg.members(&room).len(), 3);
    }

    #[test]
    fn test_join_notifies_existing_members() {
        let mut reg = RoomRegistry::default();
        let room = reg.create_room(&pid("alice"), None).room_id;
        reg.join_room(&pid("bob"), &room, None).unwrap();
        let admission = reg.join_room(&pid("carol"), &room, None).unwrap();

        let mut targets: Vec<_> = admission
            .notifications
            .iter()
            .map(|n| n.to.as_str().to_string())
            .collect();
        targets.sort();
        assert_eq!(targets, vec!["alice", "bob"]);
        assert!(admission.notifications.iter().all(|n| matches!(
            &n.event,
            RelayEvent::ParticipantJoined { id, .. } if id == &pid("carol")
        )));
        assert_eq!(admission.participants.len(), 2);
    }

    #[test]
    fn test_rejoin_same_room_is_idempotent() {
        let mut reg = RoomRegistry::default();
        let room = reg.create_room(&pid("alice"), None).room_id;
        reg.join_room(&pid("bob"), &room, None).unwrap();
        let again = reg.join_room(&pid("bob"), &room, None).unwrap();
        assert!(again.notifications.is_empty());
        assert_eq!(reg.members(&room).len(), 2);
    }

    #[test]
    fn test_leave_deletes_empty_room() {
        let mut reg = RoomRegistry::default();
        let room = reg.create_room(&pid("alice"), None).room_id;
        reg.join_room(&pid("bob"), &room, None).unwrap();

        let notes = reg.leave_room(&room, &pid("bob"));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].to, pid("alice"));
        assert_eq!(
            notes[0].event,
            RelayEvent::ParticipantLeft { id: pid("bob") }
        );
        assert_eq!(reg.room_count(), 1);

        assert!(reg.leave_room(&room, &pid("alice")).is_empty());
        assert_eq!(reg.room_count(), 0);
        assert!(reg.room_info(&room).is_none());
    }

    #[test]
    fn test_joining_another_room_leaves_previous() {
        let mut reg = RoomRegistry::default();
        let first = reg.create_room(&pid("alice"), None).room_id;
        reg.join_room(&pid("bob"), &first, None).unwrap();
        let second = reg.create_room(&pid("carol"), None).room_id;

        let admission = reg.join_room(&pid("bob"), &second, None).unwrap();
        assert!(admission.notifications.iter().any(|n| n.to == pid("alice")
            && n.event == RelayEvent::ParticipantLeft { id: pid("bob") }));
        assert_eq!(reg.room_of(&pid("bob")), Some(&second));
        assert_eq!(reg.members(&first).len(), 1);
    }

    #[test]
    fn test_rename_broadcasts() {
        let mut reg = RoomRegistry::default();
        let alice = reg.connect(pid("alice"));
        let room = reg.create_room(&pid("alice"), None).room_id;
        reg.join_room(&pid("bob"), &room, None).unwrap();

        let notes = reg.rename(&pid("alice"), "  Alice  ");
        assert_eq!(notes.len(), 2);
        assert!(notes.contains(&Notification::new(
            pid("alice"),
            RelayEvent::NameChanged {
                new_name: "Alice".to_string()
            }
        )));
        assert!(notes.contains(&Notification::new(
            pid("bob"),
            RelayEvent::ParticipantRenamed {
                id: pid("alice"),
                old_name: alice.name,
                new_name: "Alice".to_string(),
            }
        )));
        assert!(reg.rename(&pid("alice"), "   ").is_empty());
        assert_eq!(reg.identity(&pid("alice")).unwrap().name, "Alice");
    }

    #[test]
    fn test_disconnect_leaves_room() {
        let mut reg = RoomRegistry::default();
        let room = reg.create_room(&pid("alice"), None).room_id;
        reg.join_room(&pid("bob"), &room, None).unwrap();

        let notes = reg.disconnect(&pid("alice"));
        assert_eq!(notes.len(), 1);
        assert_eq!(reg.participant_count(), 1);
        assert!(!reg.shares_room(&pid("alice"), &pid("bob")));
    }

    #[test]
    fn test_room_info() {
        let mut reg = registry_with_capacity(4);
        let room = reg.create_room(&pid("alice"), Some("pw")).room_id;
        let info = reg.room_info(&room).unwrap();
        assert_eq!(info.user_count, 1);
        assert!(info.has_password);
        assert_eq!(info.max_users, 4);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["userCount"], 1);
        assert_eq!(json["hasPassword"], true);
    }

    #[test]
    fn test_sweep_keeps_occupied_rooms() {
        let mut reg = RoomRegistry::new(RegistryConfig {
            max_room_size: 10,
            room_idle_timeout: Duration::from_secs(1),
        });
        let room = reg.create_room(&pid("alice"), None).room_id;
        let later = Instant::now() + Duration::from_secs(10);
        assert!(reg.sweep(later).is_empty());
        assert!(reg.room_info(&room).is_some());
    }

    #[test]
    fn test_empty_password_means_none() {
        let mut reg = RoomRegistry::default();
        let admission = reg.create_room(&pid("alice"), Some(""));
        assert!(!admission.has_password);
        reg.join_room(&pid("bob"), &admission.room_id, Some("anything"))
            .unwrap();
    }
}
