//! Delivery of the `--send` files to each participant
//!
//! A link carries one outgoing transfer at a time, so every participant gets
//! a courier task that offers the files in order and waits for each one to
//! finish streaming before offering the next. Files a participant already
//! received are skipped when its link is rebuilt.

use meshdrop_webrtc::{
    Direction, OutgoingFile, ParticipantId, Session, SessionEvent, TransferError, TransferId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Courier {
    task: JoinHandle<()>,
    /// Outcome of each outgoing transfer: `true` once fully sent
    outcomes: mpsc::UnboundedSender<(TransferId, bool)>,
}

pub struct Deliveries {
    session: Arc<Session>,
    files: Arc<Vec<OutgoingFile>>,
    /// Indices into `files` each participant has received
    delivered: Arc<Mutex<HashMap<ParticipantId, HashSet<usize>>>>,
    couriers: Mutex<HashMap<ParticipantId, Courier>>,
}

impl Deliveries {
    pub fn new(session: Arc<Session>, files: Vec<OutgoingFile>) -> Self {
        Self {
            session,
            files: Arc::new(files),
            delivered: Arc::new(Mutex::new(HashMap::new())),
            couriers: Mutex::new(HashMap::new()),
        }
    }

    /// Follow link and transfer events for the participants being served
    pub fn route(&self, event: &SessionEvent) {
        match event {
            SessionEvent::LinkOpen { participant } => self.start(participant),
            SessionEvent::LinkClosed { participant } => self.stop(participant),
            SessionEvent::TransferCompleted {
                participant,
                transfer_id,
                direction: Direction::Outgoing,
            } => self.finished(participant, transfer_id, true),
            SessionEvent::TransferFailed {
                participant,
                transfer_id,
                direction: Direction::Outgoing,
                ..
            } => self.finished(participant, transfer_id, false),
            _ => {}
        }
    }

    /// Number of files `participant` has received from us
    pub fn delivered(&self, participant: &ParticipantId) -> usize {
        lock(&self.delivered).get(participant).map_or(0, HashSet::len)
    }

    fn start(&self, participant: &ParticipantId) {
        if self.files.is_empty() {
            return;
        }
        let (outcomes, outcome_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(
            self.session.clone(),
            participant.clone(),
            self.files.clone(),
            self.delivered.clone(),
            outcome_rx,
        ));
        let previous = lock(&self.couriers).insert(participant.clone(), Courier { task, outcomes });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    fn stop(&self, participant: &ParticipantId) {
        if let Some(courier) = lock(&self.couriers).remove(participant) {
            courier.task.abort();
        }
    }

    fn finished(&self, participant: &ParticipantId, transfer_id: &TransferId, completed: bool) {
        if let Some(courier) = lock(&self.couriers).get(participant) {
            let _ = courier.outcomes.send((transfer_id.clone(), completed));
        }
    }
}

impl Drop for Deliveries {
    fn drop(&mut self) {
        for (_, courier) in lock(&self.couriers).drain() {
            courier.task.abort();
        }
    }
}

async fn deliver(
    session: Arc<Session>,
    to: ParticipantId,
    files: Arc<Vec<OutgoingFile>>,
    delivered: Arc<Mutex<HashMap<ParticipantId, HashSet<usize>>>>,
    mut outcomes: mpsc::UnboundedReceiver<(TransferId, bool)>,
) {
    for (index, file) in files.iter().enumerate() {
        let done = lock(&delivered)
            .get(&to)
            .is_some_and(|sent| sent.contains(&index));
        if done {
            debug!("{} already has {}", to.short(), file.name);
            continue;
        }

        let transfer_id = match session.send_file(&to, file.clone()).await {
            Ok(transfer_id) => transfer_id,
            // The next LinkOpen starts a fresh courier
            Err(TransferError::NotConnected) => return,
            Err(e) => {
                warn!("Sending {} to {} failed: {}", file.name, to.short(), e);
                continue;
            }
        };
        info!("{} accepted {} ({})", to.short(), file.name, transfer_id);

        let completed = loop {
            match outcomes.recv().await {
                Some((id, completed)) if id == transfer_id => break completed,
                Some(_) => {}
                None => return,
            }
        };
        if completed {
            lock(&delivered).entry(to.clone()).or_default().insert(index);
            println!("Sent {} to {}", file.name, to.short());
        }
    }
}
