//! One peer link: negotiator, transfer engine and directory gossip
//!
//! A supervisor task follows the negotiator's [`LinkEvent`]s. When a
//! channel opens it is handed to the transfer engine, the local file
//! catalogue is sent, and a reader task routes inbound frames. When the
//! channel goes away every in-flight transfer on the link fails.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::directory::FileDirectory;
use crate::negotiator::{LinkEvent, LinkNegotiator, NegotiationError, NegotiatorConfig};
use crate::protocol::{ChannelFrame, ControlMessage};
use crate::transfer::{TransferConfig, TransferEngine, TransferError};
use crate::transport::{same_channel, DataChannel, PeerConnectionFactory, SignalingRelay};
use crate::types::{ChannelState, ParticipantId, Role, RoomId, SessionEvent, SessionEventSender};
use meshdrop_room::SignalPayload;

/// Everything links of one session share
#[derive(Clone)]
pub struct LinkEnv {
    pub local: ParticipantId,
    pub room: RoomId,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub relay: Arc<dyn SignalingRelay>,
    pub directory: Arc<Mutex<FileDirectory>>,
    pub negotiator: NegotiatorConfig,
    pub transfer: TransferConfig,
    pub events: SessionEventSender,
}

pub struct PeerLink {
    remote: ParticipantId,
    negotiator: Arc<LinkNegotiator>,
    engine: Arc<TransferEngine>,
    events: SessionEventSender,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    /// Create the link and start supervising it. Call [`PeerLink::start`]
    /// to begin negotiating.
    pub fn new(env: &LinkEnv, remote: ParticipantId) -> Arc<Self> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let negotiator = LinkNegotiator::new(
            env.local.clone(),
            remote.clone(),
            env.room.clone(),
            env.factory.clone(),
            env.relay.clone(),
            env.negotiator.clone(),
            link_tx,
        );
        let engine = TransferEngine::new(remote.clone(), env.transfer.clone(), env.events.clone());

        let context = LinkContext {
            remote: remote.clone(),
            engine: engine.clone(),
            directory: env.directory.clone(),
            events: env.events.clone(),
        };
        let supervisor = tokio::spawn(supervise(context, link_rx));

        Arc::new(Self {
            remote,
            negotiator,
            engine,
            events: env.events.clone(),
            supervisor: std::sync::Mutex::new(Some(supervisor)),
        })
    }

    pub async fn start(&self) -> Result<(), NegotiationError> {
        self.negotiator.start().await
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.negotiator.role()
    }

    pub fn negotiator(&self) -> &Arc<LinkNegotiator> {
        &self.negotiator
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    /// Whether files can be offered right now
    pub async fn is_open(&self) -> bool {
        self.negotiator.channel_state().await == ChannelState::Open
            && self.engine.is_connected().await
    }

    /// Apply a relayed negotiation message. Failures are logged and the
    /// message is dropped.
    pub async fn handle_signal(&self, payload: SignalPayload) {
        let kind = payload.kind();
        if let Err(e) = self.negotiator.handle_signal(payload).await {
            warn!(
                "Dropping {} from {}: {}",
                kind,
                self.remote.short(),
                e
            );
        }
    }

    pub async fn close(&self) {
        self.negotiator.close().await;
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = supervisor {
            handle.abort();
        }
        if let Some(channel) = self.engine.take_channel().await {
            channel.close().await;
            self.engine.fail_all(TransferError::NotConnected).await;
            let _ = self.events.send(SessionEvent::LinkClosed {
                participant: self.remote.clone(),
            });
        }
        info!("Link to {} closed", self.remote.short());
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(handle) = supervisor.take() {
                handle.abort();
            }
        }
    }
}

#[derive(Clone)]
struct LinkContext {
    remote: ParticipantId,
    engine: Arc<TransferEngine>,
    directory: Arc<Mutex<FileDirectory>>,
    events: SessionEventSender,
}

impl LinkContext {
    async fn channel_up(&self, channel: &Arc<dyn DataChannel>) {
        self.engine.attach(channel.clone()).await;
        let _ = self.events.send(SessionEvent::LinkOpen {
            participant: self.remote.clone(),
        });

        let entries = self.directory.lock().await.entries().to_vec();
        debug!(
            "Sending {} directory entries to {}",
            entries.len(),
            self.remote.short()
        );
        if let Err(e) = self
            .engine
            .send_control(&ControlMessage::FilesList { entries })
            .await
        {
            warn!("Failed to send files-list to {}: {}", self.remote.short(), e);
        }
    }

    async fn channel_down(&self, channel: &Arc<dyn DataChannel>) {
        if !self.engine.detach(channel).await {
            return;
        }
        self.engine.fail_all(TransferError::NotConnected).await;
        info!("Channel to {} lost", self.remote.short());
        let _ = self.events.send(SessionEvent::LinkClosed {
            participant: self.remote.clone(),
        });
    }

    async fn handle_text(&self, text: &str) {
        match ControlMessage::decode(text) {
            Ok(ControlMessage::FilesList { entries }) => {
                let added = self.directory.lock().await.merge(entries);
                if !added.is_empty() {
                    debug!(
                        "{} new directory entries from {}",
                        added.len(),
                        self.remote.short()
                    );
                    let _ = self.events.send(SessionEvent::DirectoryUpdated {
                        participant: self.remote.clone(),
                        added,
                    });
                }
            }
            Ok(msg) => self.engine.handle_control(msg).await,
            Err(e) => warn!(
                "Malformed control message from {}: {}",
                self.remote.short(),
                e
            ),
        }
    }
}

async fn supervise(context: LinkContext, mut link_events: mpsc::UnboundedReceiver<LinkEvent>) {
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<Arc<dyn DataChannel>>();
    let mut readers: HashMap<usize, (Arc<dyn DataChannel>, JoinHandle<()>)> = HashMap::new();
    let mut current: Option<Arc<dyn DataChannel>> = None;

    loop {
        tokio::select! {
            event = link_events.recv() => match event {
                Some(LinkEvent::ChannelOpen(channel)) => {
                    if let Some(old) = current.take() {
                        context.channel_down(&old).await;
                    }
                    context.channel_up(&channel).await;
                    let reader = tokio::spawn(read_frames(
                        context.clone(),
                        channel.clone(),
                        ended_tx.clone(),
                    ));
                    readers.insert(channel_key(&channel), (channel.clone(), reader));
                    current = Some(channel);
                }
                Some(LinkEvent::ChannelLost) => {
                    if let Some(old) = current.take() {
                        context.channel_down(&old).await;
                    }
                }
                None => break,
            },
            Some(channel) = ended_rx.recv() => {
                readers.remove(&channel_key(&channel));
                if current.as_ref().is_some_and(|c| same_channel(c, &channel)) {
                    current = None;
                    context.channel_down(&channel).await;
                }
            }
        }
    }

    for (_, (channel, reader)) in readers {
        reader.abort();
        context.channel_down(&channel).await;
    }
}

fn channel_key(channel: &Arc<dyn DataChannel>) -> usize {
    Arc::as_ptr(channel) as *const () as usize
}

async fn read_frames(
    context: LinkContext,
    channel: Arc<dyn DataChannel>,
    ended: mpsc::UnboundedSender<Arc<dyn DataChannel>>,
) {
    while let Some(frame) = channel.recv().await {
        match frame {
            ChannelFrame::Text(text) => context.handle_text(&text).await,
            ChannelFrame::Binary(data) => context.engine.handle_binary(data).await,
        }
    }
    debug!("Reader for {} finished", context.remote.short());
    let _ = ended.send(channel);
}
