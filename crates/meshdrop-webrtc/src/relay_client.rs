//! WebSocket client for the signaling relay
//!
//! Holds one connection to the relay's `/ws` endpoint. Requests are queued
//! to a writer task; everything the relay pushes is decoded and handed to
//! the caller as [`RelayEvent`]s.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::transport::{SignalingRelay, TransportError};
use crate::types::{ParticipantId, RoomId};
use meshdrop_room::{Identity, RelayEvent, RelayRequest, SignalMessage};

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Relay connection closed")]
    Closed,
}

pub struct RelayClient {
    identity: Identity,
    requests: mpsc::UnboundedSender<RelayRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect and wait for the relay's welcome, which carries our identity
    pub async fn connect(
        url: &str,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayEvent>), RelayClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let identity = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayEvent>(&text)? {
                    RelayEvent::Welcome { identity } => break identity,
                    other => debug!("Ignoring {:?} before welcome", other),
                },
                Some(Ok(Message::Close(_))) | None => return Err(RelayClientError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        };
        debug!(
            "Connected to relay {} as {} ({})",
            url,
            identity.name,
            identity.id.short()
        );

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<RelayRequest>();
        let writer = tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode relay request: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayEvent>(&text) {
                        Ok(event) => {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Malformed relay event: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            debug!("Relay connection closed");
        });

        let client = Arc::new(Self {
            identity,
            requests: request_tx,
            tasks: vec![writer, reader],
        });
        Ok((client, event_rx))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn id(&self) -> &ParticipantId {
        &self.identity.id
    }

    fn request(&self, request: RelayRequest) -> Result<(), RelayClientError> {
        self.requests
            .send(request)
            .map_err(|_| RelayClientError::Closed)
    }

    pub fn create_room(&self, password: Option<String>) -> Result<(), RelayClientError> {
        self.request(RelayRequest::CreateRoom { password })
    }

    pub fn join_room(&self, room_id: RoomId, password: Option<String>) -> Result<(), RelayClientError> {
        self.request(RelayRequest::JoinRoom { room_id, password })
    }

    pub fn leave_room(&self) -> Result<(), RelayClientError> {
        self.request(RelayRequest::LeaveRoom)
    }

    pub fn change_name(&self, new_name: impl Into<String>) -> Result<(), RelayClientError> {
        self.request(RelayRequest::ChangeName {
            new_name: new_name.into(),
        })
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingRelay for RelayClient {
    async fn send_signal(&self, msg: SignalMessage) -> Result<(), TransportError> {
        self.requests
            .send(RelayRequest::Signal { message: msg })
            .map_err(|_| TransportError::Disconnected)
    }
}
