//! WebSocket signaling relay
//!
//! Routes:
//! - `GET /ws`: JSON relay protocol (see [`crate::protocol`])
//! - `GET /api/health`: `{status, rooms, connections}`
//! - `GET /api/room/:room_id`: [`RoomInfo`] or 404
//!
//! Each connection gets its own outbound queue, so events for one
//! participant are delivered in the order they were produced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::protocol::{ParticipantId, RelayEvent, RelayRequest, RoomId, SignalMessage};
use crate::registry::{Notification, RegistryConfig, RoomInfo, RoomRegistry};

/// Shared relay state
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<Mutex<RoomRegistry>>,
    clients: Arc<RwLock<HashMap<ParticipantId, mpsc::UnboundedSender<RelayEvent>>>>,
}

impl RelayState {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(RoomRegistry::new(config))),
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<Mutex<RoomRegistry>> {
        &self.registry
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn send_to(&self, to: &ParticipantId, event: RelayEvent) {
        let clients = self.clients.read().await;
        match clients.get(to) {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Dropping event for closed connection {}", to.short());
                }
            }
            None => debug!("No connection for {}", to.short()),
        }
    }

    async fn dispatch(&self, notifications: Vec<Notification>) {
        for n in notifications {
            self.send_to(&n.to, n.event).await;
        }
    }

    async fn handle_request(&self, from: &ParticipantId, request: RelayRequest) {
        match request {
            RelayRequest::CreateRoom { password } => {
                let admission = self
                    .registry
                    .lock()
                    .await
                    .create_room(from, password.as_deref());
                self.dispatch(admission.notifications).await;
                self.send_to(
                    from,
                    RelayEvent::RoomCreated {
                        room_id: admission.room_id,
                        identity: admission.identity,
                        has_password: admission.has_password,
                    },
                )
                .await;
            }
            RelayRequest::JoinRoom { room_id, password } => {
                let result = self
                    .registry
                    .lock()
                    .await
                    .join_room(from, &room_id, password.as_deref());
                match result {
                    Ok(admission) => {
                        self.send_to(
                            from,
                            RelayEvent::RoomJoined {
                                room_id: admission.room_id,
                                identity: admission.identity,
                                participants: admission.participants,
                            },
                        )
                        .await;
                        self.dispatch(admission.notifications).await;
                    }
                    Err(reason) => {
                        debug!("{} refused from {}: {}", from.short(), room_id, reason);
                        self.send_to(
                            from,
                            RelayEvent::RoomError {
                                reason,
                                message: reason.to_string(),
                            },
                        )
                        .await;
                    }
                }
            }
            RelayRequest::LeaveRoom => {
                let notifications = self.registry.lock().await.leave_current(from);
                self.dispatch(notifications).await;
            }
            RelayRequest::ChangeName { new_name } => {
                let notifications = self.registry.lock().await.rename(from, &new_name);
                self.dispatch(notifications).await;
            }
            RelayRequest::Signal { message } => self.forward_signal(from, message).await,
        }
    }

    /// Forward a signal to its target if both share the sender's room.
    /// `fromParticipant` is always rewritten to the real sender.
    async fn forward_signal(&self, from: &ParticipantId, mut message: SignalMessage) {
        let allowed = {
            let registry = self.registry.lock().await;
            registry.room_of(from) == Some(&message.room_id)
                && registry.shares_room(from, &message.target_participant)
        };

        if !allowed {
            warn!(
                "Rejected {} from {} to {}: not in the same room",
                message.payload.kind(),
                from.short(),
                message.target_participant.short()
            );
            self.send_to(
                from,
                RelayEvent::Error {
                    message: "Target is not in your room".to_string(),
                },
            )
            .await;
            return;
        }

        message.from_participant = from.clone();
        let target = message.target_participant.clone();
        self.send_to(&target, RelayEvent::Signal { message }).await;
    }
}

pub struct RelayServer {
    state: RelayState,
    addr: String,
    cleanup_interval: Duration,
}

impl RelayServer {
    pub fn new(config: RegistryConfig, addr: String) -> Self {
        Self {
            state: RelayState::new(config),
            addr,
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    /// How often empty and idle rooms are swept
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/health", get(health_check))
            .route("/api/room/:room_id", get(room_info))
            .with_state(self.state.clone())
    }

    /// Bind to the configured address and serve until the listener fails
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Signaling relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let sweeper = spawn_sweeper(self.state.clone(), self.cleanup_interval);
        let app = self.router();
        let result = axum::serve(listener, app).await;
        sweeper.abort();
        result?;
        Ok(())
    }
}

/// Shortest sweep period; a zero interval from config is raised to this
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

fn spawn_sweeper(state: RelayState, interval: Duration) -> tokio::task::JoinHandle<()> {
    let interval = interval.max(MIN_CLEANUP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = state.registry.lock().await.sweep(Instant::now());
            if !removed.is_empty() {
                info!("Cleaned up {} rooms", removed.len());
            }
        }
    })
}

async fn health_check(State(state): State<RelayState>) -> impl IntoResponse {
    let rooms = state.registry.lock().await.room_count();
    let connections = state.connection_count().await;
    Json(json!({
        "status": "ok",
        "rooms": rooms,
        "connections": connections,
    }))
}

async fn room_info(
    State(state): State<RelayState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomInfo>, StatusCode> {
    state
        .registry
        .lock()
        .await
        .room_info(&RoomId::new(room_id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();

    let id = ParticipantId::generate();
    let identity = state.registry.lock().await.connect(id.clone());
    state.clients.write().await.insert(id.clone(), tx.clone());
    info!("{} connected as {}", id.short(), identity.name);
    let _ = tx.send(RelayEvent::Welcome { identity });

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode relay event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<RelayRequest>(&text) {
                Ok(request) => state.handle_request(&id, request).await,
                Err(e) => {
                    warn!("Malformed request from {}: {}", id.short(), e);
                    let _ = tx.send(RelayEvent::Error {
                        message: format!("Malformed request: {}", e),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    state.clients.write().await.remove(&id);
    let notifications = state.registry.lock().await.disconnect(&id);
    state.dispatch(notifications).await;
    info!("{} disconnected", id.short());

    drop(tx);
    let _ = send_task.await;
}
