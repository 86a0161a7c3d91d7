//! Chunked file transfer over one link
//!
//! Sending: `file-offer`, wait for `file-answer` (bounded by the offer
//! timeout), then stream `file-chunk` header + binary frame pairs and
//! finish with `file-complete`. The sender suspends whenever the channel
//! buffers more than `max_buffered_bytes` and resumes at `low_water_bytes`.
//!
//! Receiving: an offer is surfaced as [`SessionEvent::IncomingOffer`] and
//! must be accepted or rejected. Each chunk header marks which slot the
//! next binary frame fills. The chunk header flagged `is_last` (or
//! `file-complete` for empty files) triggers assembly.
//!
//! Binary frames carry no transfer id, so at most one transfer per
//! direction may be in flight on a link.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::protocol::{assemble, split_chunks, total_chunks, ControlMessage};
use crate::transport::{same_channel, DataChannel};
use crate::types::{
    Direction, IncomingOffer, ParticipantId, ReceivedFile, SessionEvent, SessionEventSender,
    TransferId, TransferStatus, CHUNK_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("Offer was not answered in time")]
    Timeout,
    #[error("Transfer was declined")]
    Rejected,
    #[error("missing chunks ({0})")]
    MissingChunks(usize),
    #[error("Another transfer is already in progress on this link")]
    LinkBusy,
    #[error("Link is not connected")]
    NotConnected,
    #[error("Read error: {0}")]
    Read(String),
    #[error("Send error: {0}")]
    Send(String),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Unknown transfer")]
    UnknownTransfer,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub offer_timeout: Duration,
    /// Sending pauses above this many buffered bytes
    pub max_buffered_bytes: usize,
    /// and resumes at or below this many
    pub low_water_bytes: usize,
    pub drain_poll: Duration,
    /// Larger incoming offers are declined
    pub max_file_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            offer_timeout: Duration::from_secs(15),
            max_buffered_bytes: 16 * 1024 * 1024,
            low_water_bytes: 1024 * 1024,
            drain_poll: Duration::from_millis(100),
            max_file_size: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl From<&meshdrop_config::TransferConfig> for TransferConfig {
    fn from(config: &meshdrop_config::TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            offer_timeout: Duration::from_millis(config.offer_timeout_ms),
            max_buffered_bytes: config.max_buffered_bytes,
            low_water_bytes: config.low_water_bytes.min(config.max_buffered_bytes),
            drain_poll: Duration::from_millis(config.drain_poll_ms.max(1)),
            max_file_size: config.max_file_size,
        }
    }
}

#[derive(Debug, Clone)]
enum FileSource {
    Memory(Bytes),
    Disk(PathBuf),
}

/// A file to be offered. Disk files are read only once the offer is
/// accepted.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    source: FileSource,
}

impl OutgoingFile {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    pub async fn from_path(path: &Path, mime_type: impl Into<String>) -> Result<Self, TransferError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::Read(format!("{}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(TransferError::Read(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            mime_type: mime_type.into(),
            size: metadata.len(),
            source: FileSource::Disk(path.to_path_buf()),
        })
    }

    async fn read(&self) -> Result<Bytes, TransferError> {
        let data = match &self.source {
            FileSource::Memory(data) => data.clone(),
            FileSource::Disk(path) => Bytes::from(
                tokio::fs::read(path)
                    .await
                    .map_err(|e| TransferError::Read(format!("{}: {}", path.display(), e)))?,
            ),
        };
        if data.len() as u64 != self.size {
            return Err(TransferError::Read(format!(
                "{} changed size ({} -> {} bytes)",
                self.name,
                self.size,
                data.len()
            )));
        }
        Ok(data)
    }
}

type AnswerSender = oneshot::Sender<Result<bool, TransferError>>;

struct OutgoingTransfer {
    status: TransferStatus,
    /// Present until the offer is answered
    answer: Option<AnswerSender>,
}

struct IncomingTransfer {
    offer: IncomingOffer,
    status: TransferStatus,
    slots: Vec<Option<Bytes>>,
    bytes_moved: u64,
}

/// Slot the next binary frame belongs to
struct PendingChunk {
    transfer_id: TransferId,
    index: u32,
    size: u32,
    is_last: bool,
}

#[derive(Default)]
struct EngineState {
    outgoing: HashMap<TransferId, OutgoingTransfer>,
    incoming: HashMap<TransferId, IncomingTransfer>,
    expected_chunk: Option<PendingChunk>,
}

/// Transfer engine for the link to one remote participant
pub struct TransferEngine {
    peer: ParticipantId,
    config: TransferConfig,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    /// Keeps a chunk header and its binary frame adjacent on the wire
    send_lock: Mutex<()>,
    state: Mutex<EngineState>,
    events: SessionEventSender,
}

impl TransferEngine {
    pub fn new(peer: ParticipantId, config: TransferConfig, events: SessionEventSender) -> Arc<Self> {
        Arc::new(Self {
            peer,
            config,
            channel: Mutex::new(None),
            send_lock: Mutex::new(()),
            state: Mutex::new(EngineState::default()),
            events,
        })
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub async fn attach(&self, channel: Arc<dyn DataChannel>) {
        *self.channel.lock().await = Some(channel);
    }

    /// Detach `channel` if it is the current one
    pub async fn detach(&self, channel: &Arc<dyn DataChannel>) -> bool {
        let mut current = self.channel.lock().await;
        match current.as_ref() {
            Some(c) if same_channel(c, channel) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Detach whatever channel is current
    pub async fn take_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().await.take()
    }

    pub async fn is_connected(&self) -> bool {
        self.channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Number of transfers still tracked in either direction
    pub async fn transfer_count(&self) -> usize {
        let state = self.state.lock().await;
        state.outgoing.len() + state.incoming.len()
    }

    pub async fn status(&self, transfer_id: &TransferId) -> Option<TransferStatus> {
        let state = self.state.lock().await;
        state
            .outgoing
            .get(transfer_id)
            .map(|t| t.status)
            .or_else(|| state.incoming.get(transfer_id).map(|t| t.status))
    }

    async fn current_channel(&self) -> Result<Arc<dyn DataChannel>, TransferError> {
        self.channel
            .lock()
            .await
            .clone()
            .filter(|c| c.is_open())
            .ok_or(TransferError::NotConnected)
    }

    async fn send_on(
        &self,
        channel: &dyn DataChannel,
        msg: &ControlMessage,
    ) -> Result<(), TransferError> {
        let text = msg.encode().map_err(|e| TransferError::Send(e.to_string()))?;
        let _guard = self.send_lock.lock().await;
        channel
            .send_text(text)
            .await
            .map_err(|e| TransferError::Send(e.to_string()))
    }

    /// Send a control message on the current channel
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        let channel = self.current_channel().await?;
        self.send_on(channel.as_ref(), msg).await
    }

    async fn send_chunk(
        &self,
        channel: &dyn DataChannel,
        header: &ControlMessage,
        data: Bytes,
    ) -> Result<(), TransferError> {
        let text = header
            .encode()
            .map_err(|e| TransferError::Send(e.to_string()))?;
        let _guard = self.send_lock.lock().await;
        channel
            .send_text(text)
            .await
            .map_err(|e| TransferError::Send(e.to_string()))?;
        channel
            .send_binary(data)
            .await
            .map_err(|e| TransferError::Send(e.to_string()))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_failed(&self, transfer_id: TransferId, direction: Direction, error: TransferError) {
        self.emit(SessionEvent::TransferFailed {
            participant: self.peer.clone(),
            transfer_id,
            direction,
            error,
        });
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Offer `file` and wait for the answer. Once accepted the chunks are
    /// streamed in the background; completion and progress arrive as
    /// session events.
    pub async fn offer(
        self: &Arc<Self>,
        file: OutgoingFile,
        transfer_id: TransferId,
    ) -> Result<TransferId, TransferError> {
        let channel = self.current_channel().await?;
        let chunks = total_chunks(file.size, self.config.chunk_size);

        let (answer_tx, answer_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.outgoing.values().any(|t| t.status.is_active()) {
                return Err(TransferError::LinkBusy);
            }
            state.outgoing.insert(
                transfer_id.clone(),
                OutgoingTransfer {
                    status: TransferStatus::Offered,
                    answer: Some(answer_tx),
                },
            );
        }

        let offer = ControlMessage::FileOffer {
            transfer_id: transfer_id.clone(),
            file_name: file.name.clone(),
            file_size: file.size,
            mime_type: file.mime_type.clone(),
            total_chunks: chunks,
        };
        if let Err(e) = self.send_on(channel.as_ref(), &offer).await {
            self.state.lock().await.outgoing.remove(&transfer_id);
            return Err(e);
        }
        info!(
            "Offered {} ({} bytes, {} chunks) to {}",
            file.name,
            file.size,
            chunks,
            self.peer.short()
        );

        let answer = match tokio::time::timeout(self.config.offer_timeout, answer_rx).await {
            Ok(Ok(answer)) => answer,
            // Sender dropped without a verdict
            Ok(Err(_)) => Err(TransferError::NotConnected),
            Err(_) => Err(TransferError::Timeout),
        };
        let failure = match answer {
            Ok(true) => None,
            Ok(false) => Some(TransferError::Rejected),
            Err(e) => Some(e),
        };
        if let Some(error) = failure {
            self.state.lock().await.outgoing.remove(&transfer_id);
            if error == TransferError::Timeout {
                // Lets the receiver drop its pending offer
                let notice = ControlMessage::FileError {
                    transfer_id: transfer_id.clone(),
                    error: error.to_string(),
                };
                if let Err(e) = self.send_on(channel.as_ref(), &notice).await {
                    debug!("Could not withdraw {}: {}", transfer_id, e);
                }
            }
            info!("Transfer {} to {} ended: {}", transfer_id, self.peer.short(), error);
            self.emit_failed(transfer_id, Direction::Outgoing, error.clone());
            return Err(error);
        }

        let this = self.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move { this.stream(id, file, channel).await });
        Ok(transfer_id)
    }

    async fn stream(
        self: Arc<Self>,
        transfer_id: TransferId,
        file: OutgoingFile,
        channel: Arc<dyn DataChannel>,
    ) {
        match self.stream_chunks(&transfer_id, &file, channel.as_ref()).await {
            Ok(()) => {
                if self.state.lock().await.outgoing.remove(&transfer_id).is_some() {
                    info!("Sent {} to {}", file.name, self.peer.short());
                    self.emit(SessionEvent::TransferCompleted {
                        participant: self.peer.clone(),
                        transfer_id,
                        direction: Direction::Outgoing,
                    });
                }
            }
            Err(error) => {
                // Already reported if something else dropped the record
                if self.state.lock().await.outgoing.remove(&transfer_id).is_none() {
                    return;
                }
                warn!("Transfer {} to {} failed: {}", transfer_id, self.peer.short(), error);
                let notice = ControlMessage::FileError {
                    transfer_id: transfer_id.clone(),
                    error: error.to_string(),
                };
                if let Err(e) = self.send_on(channel.as_ref(), &notice).await {
                    debug!("Could not report failure to {}: {}", self.peer.short(), e);
                }
                self.emit_failed(transfer_id, Direction::Outgoing, error);
            }
        }
    }

    async fn set_outgoing_status(&self, transfer_id: &TransferId, status: TransferStatus) -> bool {
        match self.state.lock().await.outgoing.get_mut(transfer_id) {
            Some(t) => {
                t.status = status;
                true
            }
            None => false,
        }
    }

    async fn stream_chunks(
        &self,
        transfer_id: &TransferId,
        file: &OutgoingFile,
        channel: &dyn DataChannel,
    ) -> Result<(), TransferError> {
        let data = file.read().await?;
        self.set_outgoing_status(transfer_id, TransferStatus::Transferring)
            .await;

        let chunks = total_chunks(data.len() as u64, self.config.chunk_size);
        let mut moved = 0u64;
        for (index, chunk) in split_chunks(&data, self.config.chunk_size).enumerate() {
            if !self.state.lock().await.outgoing.contains_key(transfer_id) {
                return Err(TransferError::NotConnected);
            }
            if channel.buffered_amount().await > self.config.max_buffered_bytes {
                debug!(
                    "Pausing {} until the channel drains to {} bytes",
                    transfer_id, self.config.low_water_bytes
                );
                channel
                    .wait_buffered_below(self.config.low_water_bytes, self.config.drain_poll)
                    .await;
            }

            let index = index as u32;
            let header = ControlMessage::FileChunk {
                transfer_id: transfer_id.clone(),
                chunk_index: index,
                chunk_size: chunk.len() as u32,
                is_last: index + 1 == chunks,
            };
            moved += chunk.len() as u64;
            self.send_chunk(channel, &header, chunk).await?;
            self.emit(SessionEvent::Progress {
                participant: self.peer.clone(),
                transfer_id: transfer_id.clone(),
                direction: Direction::Outgoing,
                bytes_moved: moved,
                file_size: file.size,
            });
        }

        self.send_on(
            channel,
            &ControlMessage::FileComplete {
                transfer_id: transfer_id.clone(),
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    pub async fn accept(&self, transfer_id: &TransferId) -> Result<(), TransferError> {
        {
            let mut state = self.state.lock().await;
            let busy = state.incoming.iter().any(|(id, t)| {
                id != transfer_id
                    && matches!(
                        t.status,
                        TransferStatus::Accepted | TransferStatus::Transferring
                    )
            });
            if busy {
                return Err(TransferError::LinkBusy);
            }
            let transfer = state
                .incoming
                .get_mut(transfer_id)
                .filter(|t| t.status == TransferStatus::Offered)
                .ok_or(TransferError::UnknownTransfer)?;
            transfer.status = TransferStatus::Accepted;
            transfer.slots = vec![None; transfer.offer.total_chunks as usize];
        }

        let answer = ControlMessage::FileAnswer {
            transfer_id: transfer_id.clone(),
            accepted: true,
        };
        if let Err(e) = self.send_control(&answer).await {
            self.state.lock().await.incoming.remove(transfer_id);
            return Err(e);
        }
        debug!("Accepted {} from {}", transfer_id, self.peer.short());
        Ok(())
    }

    /// Decline an offer and forget it
    pub async fn reject(&self, transfer_id: &TransferId) -> Result<(), TransferError> {
        self.state
            .lock()
            .await
            .incoming
            .remove(transfer_id)
            .ok_or(TransferError::UnknownTransfer)?;
        debug!("Rejected {} from {}", transfer_id, self.peer.short());
        self.send_control(&ControlMessage::FileAnswer {
            transfer_id: transfer_id.clone(),
            accepted: false,
        })
        .await
    }

    /// Handle a decoded control message from the remote side
    pub async fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::FileOffer {
                transfer_id,
                file_name,
                file_size,
                mime_type,
                total_chunks,
            } => {
                self.on_offer(IncomingOffer {
                    transfer_id,
                    file_name,
                    file_size,
                    mime_type,
                    total_chunks,
                })
                .await
            }
            ControlMessage::FileAnswer {
                transfer_id,
                accepted,
            } => self.resolve_answer(&transfer_id, Ok(accepted)).await,
            ControlMessage::FileChunk {
                transfer_id,
                chunk_index,
                chunk_size,
                is_last,
            } => {
                self.on_chunk_header(transfer_id, chunk_index, chunk_size, is_last)
                    .await
            }
            ControlMessage::FileComplete { transfer_id } => self.on_complete(&transfer_id).await,
            ControlMessage::FileError { transfer_id, error } => {
                self.on_remote_error(&transfer_id, error).await
            }
            ControlMessage::FilesList { .. } => {
                debug!("files-list is not a transfer message");
            }
        }
    }

    async fn on_offer(&self, offer: IncomingOffer) {
        let transfer_id = offer.transfer_id.clone();
        // Both sides chunk with the same size, so the count is exact
        let plausible = offer.file_size <= self.config.max_file_size
            && offer.total_chunks == total_chunks(offer.file_size, self.config.chunk_size);

        let decline = {
            let mut state = self.state.lock().await;
            if state.incoming.contains_key(&transfer_id) {
                warn!("Duplicate offer {} from {}", transfer_id, self.peer.short());
                return;
            }
            let busy = state.incoming.values().any(|t| {
                matches!(
                    t.status,
                    TransferStatus::Accepted | TransferStatus::Transferring
                )
            });
            if busy || !plausible {
                true
            } else {
                state.incoming.insert(
                    transfer_id.clone(),
                    IncomingTransfer {
                        offer: offer.clone(),
                        status: TransferStatus::Offered,
                        slots: Vec::new(),
                        bytes_moved: 0,
                    },
                );
                false
            }
        };

        if decline {
            info!(
                "Declining {} from {}: {}",
                offer.file_name,
                self.peer.short(),
                if plausible { "link busy" } else { "malformed offer" }
            );
            let answer = ControlMessage::FileAnswer {
                transfer_id,
                accepted: false,
            };
            if let Err(e) = self.send_control(&answer).await {
                debug!("Could not decline offer: {}", e);
            }
            return;
        }

        info!(
            "{} offers {} ({} bytes)",
            self.peer.short(),
            offer.file_name,
            offer.file_size
        );
        self.emit(SessionEvent::IncomingOffer {
            participant: self.peer.clone(),
            offer,
        });
    }

    async fn resolve_answer(&self, transfer_id: &TransferId, verdict: Result<bool, TransferError>) {
        let sender = {
            let mut state = self.state.lock().await;
            match state.outgoing.get_mut(transfer_id) {
                Some(t) => {
                    if verdict == Ok(true) {
                        t.status = TransferStatus::Accepted;
                    }
                    t.answer.take()
                }
                None => None,
            }
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(verdict);
            }
            None if verdict == Ok(true) => {
                // Accepted after we gave up; the receiver must not keep waiting
                debug!("Late acceptance of {} from {}", transfer_id, self.peer.short());
                let notice = ControlMessage::FileError {
                    transfer_id: transfer_id.clone(),
                    error: TransferError::UnknownTransfer.to_string(),
                };
                if let Err(e) = self.send_control(&notice).await {
                    debug!("Could not report unknown transfer: {}", e);
                }
            }
            None => debug!("Answer for unknown or settled transfer {}", transfer_id),
        }
    }

    async fn on_chunk_header(&self, transfer_id: TransferId, index: u32, size: u32, is_last: bool) {
        let mut state = self.state.lock().await;
        let valid = match state.incoming.get_mut(&transfer_id) {
            Some(t)
                if matches!(
                    t.status,
                    TransferStatus::Accepted | TransferStatus::Transferring
                ) && (index as usize) < t.slots.len() =>
            {
                t.status = TransferStatus::Transferring;
                true
            }
            _ => false,
        };
        if !valid {
            warn!(
                "Unexpected chunk header {}#{} from {}",
                transfer_id,
                index,
                self.peer.short()
            );
            state.expected_chunk = None;
            return;
        }
        state.expected_chunk = Some(PendingChunk {
            transfer_id,
            index,
            size,
            is_last,
        });
    }

    /// Handle a binary frame: the payload announced by the last chunk header
    pub async fn handle_binary(&self, data: Bytes) {
        let finished = {
            let mut state = self.state.lock().await;
            let Some(pending) = state.expected_chunk.take() else {
                warn!(
                    "Dropping {} byte frame from {} without a chunk header",
                    data.len(),
                    self.peer.short()
                );
                return;
            };
            let Some(transfer) = state.incoming.get_mut(&pending.transfer_id) else {
                return;
            };
            if data.len() != pending.size as usize {
                warn!(
                    "Chunk {}#{} is {} bytes, header said {}",
                    pending.transfer_id,
                    pending.index,
                    data.len(),
                    pending.size
                );
            }
            transfer.bytes_moved += data.len() as u64;
            transfer.slots[pending.index as usize] = Some(data);
            self.emit(SessionEvent::Progress {
                participant: self.peer.clone(),
                transfer_id: pending.transfer_id.clone(),
                direction: Direction::Incoming,
                bytes_moved: transfer.bytes_moved,
                file_size: transfer.offer.file_size,
            });
            pending.is_last.then_some(pending.transfer_id)
        };

        if let Some(transfer_id) = finished {
            self.finish(&transfer_id).await;
        }
    }

    async fn on_complete(&self, transfer_id: &TransferId) {
        let tracked = self.state.lock().await.incoming.contains_key(transfer_id);
        if tracked {
            // Empty file, or the last chunk never arrived
            self.finish(transfer_id).await;
        } else {
            debug!("Transfer {} from {} complete", transfer_id, self.peer.short());
        }
    }

    async fn finish(&self, transfer_id: &TransferId) {
        let Some(transfer) = self.state.lock().await.incoming.remove(transfer_id) else {
            return;
        };
        let offer = transfer.offer;

        match assemble(&transfer.slots) {
            Err(missing) => {
                warn!(
                    "Transfer {} from {} is missing {} chunks",
                    transfer_id,
                    self.peer.short(),
                    missing
                );
                let notice = ControlMessage::FileError {
                    transfer_id: transfer_id.clone(),
                    error: "missing chunks".to_string(),
                };
                if let Err(e) = self.send_control(&notice).await {
                    debug!("Could not report missing chunks: {}", e);
                }
                self.emit_failed(
                    transfer_id.clone(),
                    Direction::Incoming,
                    TransferError::MissingChunks(missing),
                );
            }
            Ok(data) => {
                if data.len() as u64 != offer.file_size {
                    warn!(
                        "{} assembled to {} bytes, {} were announced",
                        offer.file_name,
                        data.len(),
                        offer.file_size
                    );
                }
                info!(
                    "Received {} ({} bytes) from {}",
                    offer.file_name,
                    data.len(),
                    self.peer.short()
                );
                self.emit(SessionEvent::FileReceived {
                    participant: self.peer.clone(),
                    file: ReceivedFile {
                        transfer_id: transfer_id.clone(),
                        file_name: offer.file_name,
                        mime_type: offer.mime_type,
                        data,
                    },
                });
                self.emit(SessionEvent::TransferCompleted {
                    participant: self.peer.clone(),
                    transfer_id: transfer_id.clone(),
                    direction: Direction::Incoming,
                });
            }
        }
    }

    async fn on_remote_error(&self, transfer_id: &TransferId, error: String) {
        warn!(
            "{} reported an error on {}: {}",
            self.peer.short(),
            transfer_id,
            error
        );
        let error = TransferError::Remote(error);
        let (outgoing, incoming) = {
            let mut state = self.state.lock().await;
            if state
                .expected_chunk
                .as_ref()
                .is_some_and(|p| &p.transfer_id == transfer_id)
            {
                state.expected_chunk = None;
            }
            (
                state.outgoing.remove(transfer_id),
                state.incoming.remove(transfer_id),
            )
        };

        if let Some(mut transfer) = outgoing {
            match transfer.answer.take() {
                // offer() reports it
                Some(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                None => self.emit_failed(transfer_id.clone(), Direction::Outgoing, error.clone()),
            }
        }
        if incoming.is_some() {
            self.emit_failed(transfer_id.clone(), Direction::Incoming, error);
        }
    }

    /// Terminate every tracked transfer, e.g. when the link goes down
    pub async fn fail_all(&self, error: TransferError) {
        let (outgoing, incoming) = {
            let mut state = self.state.lock().await;
            state.expected_chunk = None;
            (
                std::mem::take(&mut state.outgoing),
                std::mem::take(&mut state.incoming),
            )
        };
        for (transfer_id, mut transfer) in outgoing {
            match transfer.answer.take() {
                Some(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                None => self.emit_failed(transfer_id, Direction::Outgoing, error.clone()),
            }
        }
        for (transfer_id, _) in incoming {
            self.emit_failed(transfer_id, Direction::Incoming, error.clone());
        }
    }
}
