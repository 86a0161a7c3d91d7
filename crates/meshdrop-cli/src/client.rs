//! Room participation for the `create` and `join` commands
//!
//! Connects to the relay, enters a room and runs a [`Session`] with real
//! WebRTC links. Files passed with `--send` are advertised in the
//! directory and offered to every participant, one at a time, as their
//! link opens; incoming offers are accepted and written to the output
//! directory.

use anyhow::{bail, Context, Result};
use meshdrop_room::{RelayEvent, RoomId};
use meshdrop_webrtc::{
    OutgoingFile, RealPeerConnectionFactory, ReceivedFile, RelayClient, Session, SessionConfig,
    SessionEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::delivery::Deliveries;
use crate::mime::mime_for_path;

const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

pub enum RoomAction {
    Create,
    Join(RoomId),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub relay_url: String,
    pub password: Option<String>,
    /// Files offered to every participant
    pub send: Vec<PathBuf>,
    /// Where received files are written
    pub out_dir: PathBuf,
    pub stun_servers: Vec<String>,
    pub session: SessionConfig,
}

/// Enter a room and serve it until Ctrl-C or the relay goes away
pub async fn run_room(action: RoomAction, options: ClientOptions) -> Result<()> {
    let (relay, mut relay_events) = RelayClient::connect(&options.relay_url)
        .await
        .with_context(|| format!("Failed to connect to relay {}", options.relay_url))?;
    println!("Connected as {}", relay.identity().name);

    match action {
        RoomAction::Create => relay.create_room(options.password.clone())?,
        RoomAction::Join(room_id) => relay.join_room(room_id, options.password.clone())?,
    }
    let (room_id, joined) = wait_for_admission(&mut relay_events).await?;
    println!("Room: {}", room_id);

    let mut outgoing = Vec::new();
    for path in &options.send {
        let file = OutgoingFile::from_path(path, mime_for_path(path))
            .await
            .with_context(|| format!("Cannot send {}", path.display()))?;
        outgoing.push(file);
    }

    let factory = Arc::new(RealPeerConnectionFactory::new(options.stun_servers.clone()));
    let (session, mut events) = Session::new(
        relay.id().clone(),
        room_id,
        factory,
        relay.clone(),
        options.session.clone(),
    );
    for file in &outgoing {
        session.share_file(file).await;
    }
    let deliveries = Deliveries::new(session.clone(), outgoing);

    let driver = session.clone();
    let mut relay_task = tokio::spawn(async move {
        if let Some(event) = joined {
            driver.handle_relay_event(event).await;
        }
        while let Some(event) = relay_events.recv().await {
            driver.handle_relay_event(event).await;
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                deliveries.route(&event);
                handle_event(&session, event, &options.out_dir).await;
            }
            _ = &mut relay_task => {
                warn!("Relay connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Leaving room");
                break;
            }
        }
    }

    session.close().await;
    let _ = relay.leave_room();
    relay_task.abort();
    Ok(())
}

/// Wait for the relay to confirm the create/join request. A join carries
/// the current roster, which is returned for the session to link to.
async fn wait_for_admission(
    events: &mut UnboundedReceiver<RelayEvent>,
) -> Result<(RoomId, Option<RelayEvent>)> {
    let admission = tokio::time::timeout(ADMISSION_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::RoomCreated {
                    room_id,
                    has_password,
                    ..
                } => {
                    if has_password {
                        println!("Password protected");
                    }
                    return Ok((room_id, None));
                }
                RelayEvent::RoomJoined { ref room_id, .. } => {
                    let room_id = room_id.clone();
                    return Ok((room_id, Some(event)));
                }
                RelayEvent::RoomError { message, .. } | RelayEvent::Error { message } => {
                    bail!("{}", message)
                }
                other => debug!("Ignoring {:?} while waiting for admission", other),
            }
        }
        bail!("Relay closed the connection")
    })
    .await;
    match admission {
        Ok(result) => result,
        Err(_) => bail!("Relay did not answer within {:?}", ADMISSION_TIMEOUT),
    }
}

async fn handle_event(session: &Arc<Session>, event: SessionEvent, out_dir: &Path) {
    match event {
        SessionEvent::LinkOpen { participant } => {
            println!("Connected to {}", participant.short());
        }
        SessionEvent::LinkClosed { participant } => {
            println!("Disconnected from {}", participant.short());
        }
        SessionEvent::IncomingOffer { participant, offer } => {
            println!(
                "Receiving {} ({} bytes) from {}",
                offer.file_name,
                offer.file_size,
                participant.short()
            );
            if let Err(e) = session.accept(&participant, &offer.transfer_id).await {
                warn!("Could not accept {}: {}", offer.file_name, e);
            }
        }
        SessionEvent::Progress {
            transfer_id,
            bytes_moved,
            file_size,
            ..
        } => {
            debug!("{}: {}/{} bytes", transfer_id, bytes_moved, file_size);
        }
        SessionEvent::TransferCompleted {
            participant,
            transfer_id,
            direction,
        } => {
            info!(
                "Transfer {} ({:?}) with {} complete",
                transfer_id,
                direction,
                participant.short()
            );
        }
        SessionEvent::FileReceived { participant, file } => {
            match save_received(out_dir, &file).await {
                Ok(path) => println!(
                    "Saved {} from {} to {}",
                    file.file_name,
                    participant.short(),
                    path.display()
                ),
                Err(e) => warn!("Failed to save {}: {:#}", file.file_name, e),
            }
        }
        SessionEvent::TransferFailed {
            participant,
            transfer_id,
            error,
            ..
        } => {
            warn!(
                "Transfer {} with {} failed: {}",
                transfer_id,
                participant.short(),
                error
            );
        }
        SessionEvent::DirectoryUpdated { participant, added } => {
            for entry in added {
                println!(
                    "{} shares {} ({} bytes)",
                    participant.short(),
                    entry.file_name,
                    entry.file_size
                );
            }
        }
    }
}

/// Write a received file into `dir` without overwriting anything. Only the
/// final path component of the sender's file name is used.
pub async fn save_received(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let name = Path::new(&file.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| file.transfer_id.as_str().to_string());
    let path = unique_path(dir, &name);
    tokio::fs::write(&path, &file.data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// `name`, or `stem (n).ext` for the first n that is free
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());
    let mut n = 1;
    loop {
        let file_name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(file_name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
