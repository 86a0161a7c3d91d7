//! Per-participant session
//!
//! Owns one [`PeerLink`] per other room member and is the single entry
//! point for relay traffic and file operations. Everything observable is
//! reported as a [`SessionEvent`].

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::directory::{DirectoryEntry, FileDirectory};
use crate::link::{LinkEnv, PeerLink};
use crate::negotiator::{NegotiationError, NegotiatorConfig};
use crate::protocol::ControlMessage;
use crate::transfer::{OutgoingFile, TransferConfig, TransferError};
use crate::transport::{PeerConnectionFactory, SignalingRelay};
use crate::types::{ParticipantId, RoomId, SessionEventReceiver, TransferId};
use meshdrop_room::{RelayEvent, SignalMessage, SignalPayload};

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub negotiator: NegotiatorConfig,
    pub transfer: TransferConfig,
}

impl From<&meshdrop_config::Config> for SessionConfig {
    fn from(config: &meshdrop_config::Config) -> Self {
        Self {
            negotiator: NegotiatorConfig::from(&config.transfer),
            transfer: TransferConfig::from(&config.transfer),
        }
    }
}

pub struct Session {
    env: LinkEnv,
    links: RwLock<HashMap<ParticipantId, Arc<PeerLink>>>,
}

impl Session {
    pub fn new(
        local: ParticipantId,
        room: RoomId,
        factory: Arc<dyn PeerConnectionFactory>,
        relay: Arc<dyn SignalingRelay>,
        config: SessionConfig,
    ) -> (Arc<Self>, SessionEventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let directory = Arc::new(Mutex::new(FileDirectory::new(local.clone())));
        let session = Arc::new(Self {
            env: LinkEnv {
                local,
                room,
                factory,
                relay,
                directory,
                negotiator: config.negotiator,
                transfer: config.transfer,
                events,
            },
            links: RwLock::new(HashMap::new()),
        });
        (session, receiver)
    }

    pub fn local(&self) -> &ParticipantId {
        &self.env.local
    }

    pub fn room(&self) -> &RoomId {
        &self.env.room
    }

    /// Existing link to `remote`, or a freshly started one
    async fn link_for(&self, remote: &ParticipantId) -> Result<Arc<PeerLink>, NegotiationError> {
        let link = {
            let mut links = self.links.write().await;
            if let Some(link) = links.get(remote) {
                return Ok(link.clone());
            }
            let link = PeerLink::new(&self.env, remote.clone());
            links.insert(remote.clone(), link.clone());
            link
        };
        info!(
            "Linking to {} as {:?}",
            remote.short(),
            link.role()
        );
        link.start().await?;
        Ok(link)
    }

    /// Create a link to a room member. The initiator side offers at once.
    pub async fn add_participant(&self, remote: ParticipantId) -> Result<(), NegotiationError> {
        if remote == self.env.local {
            return Ok(());
        }
        self.link_for(&remote).await.map(|_| ())
    }

    pub async fn remove_participant(&self, remote: &ParticipantId) {
        let link = self.links.write().await.remove(remote);
        if let Some(link) = link {
            link.close().await;
        }
    }

    /// Route a relayed negotiation message to its link. An offer from an
    /// unknown sender creates the link.
    pub async fn handle_signal(&self, msg: SignalMessage) {
        if msg.room_id != self.env.room || !msg.is_for(&self.env.local) {
            debug!(
                "Ignoring {} from {} for another room or participant",
                msg.payload.kind(),
                msg.from_participant.short()
            );
            return;
        }
        if msg.from_participant == self.env.local {
            return;
        }
        // Only an offer may open a link; stray answers and candidates from
        // departed participants are dropped
        let existing = self.link(&msg.from_participant).await;
        let link = match existing {
            Some(link) => Ok(link),
            None if matches!(msg.payload, SignalPayload::Offer { .. }) => {
                self.link_for(&msg.from_participant).await
            }
            None => {
                debug!(
                    "Dropping {} from unlinked {}",
                    msg.payload.kind(),
                    msg.from_participant.short()
                );
                return;
            }
        };
        match link {
            Ok(link) => link.handle_signal(msg.payload).await,
            Err(e) => warn!(
                "No link to {} for {}: {}",
                msg.from_participant.short(),
                msg.payload.kind(),
                e
            ),
        }
    }

    /// React to membership changes and signals pushed by the relay
    pub async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::RoomJoined {
                room_id,
                participants,
                ..
            } if room_id == self.env.room => {
                for participant in participants {
                    if let Err(e) = self.add_participant(participant.id.clone()).await {
                        warn!("Failed to link to {}: {}", participant.name, e);
                    }
                }
            }
            RelayEvent::ParticipantJoined { id, name } => {
                info!("{} ({}) joined", name, id.short());
                if let Err(e) = self.add_participant(id).await {
                    warn!("Failed to link to {}: {}", name, e);
                }
            }
            RelayEvent::ParticipantLeft { id } => {
                info!("{} left", id.short());
                self.remove_participant(&id).await;
            }
            RelayEvent::Signal { message } => self.handle_signal(message).await,
            _ => {}
        }
    }

    pub async fn link(&self, remote: &ParticipantId) -> Option<Arc<PeerLink>> {
        self.links.read().await.get(remote).cloned()
    }

    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.links.read().await.keys().cloned().collect()
    }

    /// Participants whose link is open
    pub async fn connected_participants(&self) -> Vec<ParticipantId> {
        let links: Vec<Arc<PeerLink>> = self.links.read().await.values().cloned().collect();
        let mut connected = Vec::new();
        for link in links {
            if link.is_open().await {
                connected.push(link.remote().clone());
            }
        }
        connected.sort();
        connected
    }

    /// Offer a file to one participant and wait for the answer
    pub async fn send_file(
        &self,
        to: &ParticipantId,
        file: OutgoingFile,
    ) -> Result<TransferId, TransferError> {
        let link = self.link(to).await.ok_or(TransferError::NotConnected)?;
        link.engine().offer(file, TransferId::generate()).await
    }

    /// Offer a file to every connected participant. Each transfer id is
    /// `<base>-<participant>`.
    pub async fn send_file_to_all(
        &self,
        file: OutgoingFile,
    ) -> Vec<(ParticipantId, Result<TransferId, TransferError>)> {
        let base = TransferId::generate();
        let mut offers = Vec::new();
        for participant in self.connected_participants().await {
            if let Some(link) = self.link(&participant).await {
                let transfer_id = base.for_participant(&participant);
                let file = file.clone();
                offers.push(async move {
                    let result = link.engine().offer(file, transfer_id).await;
                    (participant, result)
                });
            }
        }
        join_all(offers).await
    }

    pub async fn accept(
        &self,
        from: &ParticipantId,
        transfer_id: &TransferId,
    ) -> Result<(), TransferError> {
        let link = self.link(from).await.ok_or(TransferError::NotConnected)?;
        link.engine().accept(transfer_id).await
    }

    pub async fn reject(
        &self,
        from: &ParticipantId,
        transfer_id: &TransferId,
    ) -> Result<(), TransferError> {
        let link = self.link(from).await.ok_or(TransferError::NotConnected)?;
        link.engine().reject(transfer_id).await
    }

    /// Advertise a local file and push the updated catalogue to every
    /// connected participant
    pub async fn share_file(&self, file: &OutgoingFile) -> DirectoryEntry {
        let (entry, entries) = {
            let mut directory = self.env.directory.lock().await;
            let entry = directory.add_local(
                uuid::Uuid::new_v4().to_string(),
                file.name.clone(),
                file.size,
                file.mime_type.clone(),
            );
            (entry, directory.entries().to_vec())
        };

        let links: Vec<Arc<PeerLink>> = self.links.read().await.values().cloned().collect();
        let msg = ControlMessage::FilesList { entries };
        for link in links {
            if !link.is_open().await {
                continue;
            }
            if let Err(e) = link.engine().send_control(&msg).await {
                debug!("files-list to {} failed: {}", link.remote().short(), e);
            }
        }
        entry
    }

    pub async fn directory(&self) -> Vec<DirectoryEntry> {
        self.env.directory.lock().await.entries().to_vec()
    }

    /// Tear down every link
    pub async fn close(&self) {
        let links: Vec<Arc<PeerLink>> = self.links.write().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
        }
        info!("Session {} closed", self.env.local.short());
    }
}
