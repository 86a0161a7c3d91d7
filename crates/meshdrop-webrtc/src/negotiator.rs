//! Peer link negotiation
//!
//! Drives the offer/answer/candidate exchange for one pair of participants
//! and keeps the link alive:
//!
//! - The side with the greater participant id is the initiator. It creates
//!   the data channel and sends the first offer.
//! - On glare (an offer arrives while we are not stable) the polite side
//!   rolls back its own offer and answers; the impolite side ignores the
//!   remote offer.
//! - Remote candidates that arrive before a remote description are queued
//!   and applied right after one is set.
//! - A failed connection is replaced by a fresh one. Only the initiator
//!   re-offers, after `restart_delay`.
//!
//! Negotiation errors are logged and the step is dropped; rebuilding the
//! connection is the only recovery path.

use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{
    DataChannel, PeerConnection, PeerConnectionFactory, SignalingRelay, TransportError,
    TransportEvent,
};
use crate::types::{
    ChannelState, ConnectionState, IceCandidate, ParticipantId, Role, RoomId,
    SessionDescription, SignalingState, DATA_CHANNEL_LABEL,
};
use meshdrop_room::{SignalMessage, SignalPayload};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Signaling relay error: {0}")]
    Relay(TransportError),
    #[error("Link closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Delay before the initiator re-offers on a rebuilt connection
    pub restart_delay: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(1000),
        }
    }
}

impl From<&meshdrop_config::TransferConfig> for NegotiatorConfig {
    fn from(config: &meshdrop_config::TransferConfig) -> Self {
        Self {
            restart_delay: Duration::from_millis(config.restart_delay_ms),
        }
    }
}

/// Notifications for the owner of the link
pub enum LinkEvent {
    ChannelOpen(Arc<dyn DataChannel>),
    /// The connection failed and is being rebuilt
    ChannelLost,
}

struct NegotiationState {
    connection: Option<Arc<dyn PeerConnection>>,
    /// Bumped on every rebuild; events from older connections are ignored
    generation: u64,
    making_offer: bool,
    candidate_queue: Vec<IceCandidate>,
    channel_state: ChannelState,
    pump: Option<JoinHandle<()>>,
    closed: bool,
}

pub struct LinkNegotiator {
    local: ParticipantId,
    remote: ParticipantId,
    room: RoomId,
    role: Role,
    factory: Arc<dyn PeerConnectionFactory>,
    relay: Arc<dyn SignalingRelay>,
    config: NegotiatorConfig,
    /// Held for the whole of each negotiation step
    state: Mutex<NegotiationState>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    /// Generations reported failed, consumed by the restart task
    restarts: mpsc::UnboundedSender<u64>,
}

impl LinkNegotiator {
    pub fn new(
        local: ParticipantId,
        remote: ParticipantId,
        room: RoomId,
        factory: Arc<dyn PeerConnectionFactory>,
        relay: Arc<dyn SignalingRelay>,
        config: NegotiatorConfig,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Arc<Self> {
        let role = Role::for_pair(&local, &remote);
        Arc::new_cyclic(|weak| {
            let (restarts, restart_rx) = mpsc::unbounded_channel();
            tokio::spawn(restart_loop(weak.clone(), restart_rx));
            Self {
                local,
                remote,
                room,
                role,
                factory,
                relay,
                config,
                state: Mutex::new(NegotiationState {
                    connection: None,
                    generation: 0,
                    making_offer: false,
                    candidate_queue: Vec::new(),
                    channel_state: ChannelState::Unlinked,
                    pump: None,
                    closed: false,
                }),
                link_events,
                restarts,
            }
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.state.lock().await.channel_state
    }

    pub async fn signaling_state(&self) -> Option<SignalingState> {
        let state = self.state.lock().await;
        state.connection.as_ref().map(|c| c.signaling_state())
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    pub async fn queued_candidates(&self) -> usize {
        self.state.lock().await.candidate_queue.len()
    }

    /// Create the first connection; the initiator also sends its offer
    pub async fn start(self: &Arc<Self>) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock().await;
            self.ensure_connection(&mut state).await?;
        }
        debug!(
            "Link {} -> {} started as {:?}",
            self.local.short(),
            self.remote.short(),
            self.role
        );
        if self.role.is_initiator() {
            self.create_offer().await?;
        }
        Ok(())
    }

    /// Current connection, created on first use
    async fn ensure_connection(
        self: &Arc<Self>,
        state: &mut NegotiationState,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        if state.connection.is_none() {
            self.install_connection(state).await?;
        }
        state.connection.clone().ok_or(NegotiationError::Closed)
    }

    async fn install_connection(
        self: &Arc<Self>,
        state: &mut NegotiationState,
    ) -> Result<(), NegotiationError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self.factory.create(&self.remote, tx).await?;
        if self.role.is_initiator() {
            connection.create_data_channel(DATA_CHANNEL_LABEL).await?;
        }
        state.connection = Some(connection);
        state.channel_state = ChannelState::Negotiating;

        let pump = tokio::spawn(pump_events(Arc::downgrade(self), state.generation, rx));
        if let Some(old) = state.pump.replace(pump) {
            old.abort();
        }
        Ok(())
    }

    async fn signal(&self, payload: SignalPayload) -> Result<(), NegotiationError> {
        let msg = SignalMessage::new(
            self.local.clone(),
            self.remote.clone(),
            self.room.clone(),
            payload,
        );
        self.relay
            .send_signal(msg)
            .await
            .map_err(NegotiationError::Relay)
    }

    /// Start an offer. No-op unless stable and not already offering.
    pub async fn create_offer(self: &Arc<Self>) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        let connection = self.ensure_connection(&mut state).await?;
        if state.making_offer || connection.signaling_state() != SignalingState::Stable {
            debug!(
                "Skipping offer to {}: {:?}",
                self.remote.short(),
                connection.signaling_state()
            );
            return Ok(());
        }

        state.making_offer = true;
        let result = async {
            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            Ok::<_, TransportError>(offer)
        }
        .await;
        state.making_offer = false;

        let offer = result?;
        debug!("Sending offer to {}", self.remote.short());
        self.signal(SignalPayload::Offer { sdp: offer.sdp }).await
    }

    /// Dispatch a relayed negotiation message
    pub async fn handle_signal(
        self: &Arc<Self>,
        payload: SignalPayload,
    ) -> Result<(), NegotiationError> {
        match payload {
            SignalPayload::Offer { sdp } => self.handle_remote_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.handle_remote_answer(sdp).await,
            SignalPayload::IceCandidate { candidate } => {
                self.handle_remote_candidate(candidate).await
            }
        }
    }

    pub async fn handle_remote_offer(
        self: &Arc<Self>,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        let connection = self.ensure_connection(&mut state).await?;

        let collision =
            state.making_offer || connection.signaling_state() != SignalingState::Stable;
        if collision {
            if !self.role.is_polite() {
                debug!("Ignoring colliding offer from {}", self.remote.short());
                return Ok(());
            }
            debug!(
                "Offer collision with {}, rolling back local offer",
                self.remote.short()
            );
            connection.rollback().await?;
        }

        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        Self::flush_candidates(&mut state, connection.as_ref()).await;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        debug!("Sending answer to {}", self.remote.short());
        self.signal(SignalPayload::Answer { sdp: answer.sdp }).await
    }

    pub async fn handle_remote_answer(
        self: &Arc<Self>,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        let connection = self.ensure_connection(&mut state).await?;

        let signaling = connection.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            warn!(
                "Discarding answer from {} in state {:?}",
                self.remote.short(),
                signaling
            );
            return Ok(());
        }

        connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        Self::flush_candidates(&mut state, connection.as_ref()).await;
        Ok(())
    }

    pub async fn handle_remote_candidate(
        self: &Arc<Self>,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().await;
        let connection = self.ensure_connection(&mut state).await?;

        if !connection.has_remote_description().await {
            state.candidate_queue.push(candidate);
            debug!(
                "Queued candidate from {} ({} pending)",
                self.remote.short(),
                state.candidate_queue.len()
            );
            return Ok(());
        }
        connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn flush_candidates(state: &mut NegotiationState, connection: &dyn PeerConnection) {
        let queued = std::mem::take(&mut state.candidate_queue);
        for candidate in queued {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued candidate: {}", e);
            }
        }
    }

    async fn on_transport_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                // Sent under the lock so it never overtakes its description
                let state = self.state.lock().await;
                if state.closed || state.generation != generation {
                    return;
                }
                if let Err(e) = self
                    .signal(SignalPayload::IceCandidate { candidate })
                    .await
                {
                    warn!("Failed to send candidate to {}: {}", self.remote.short(), e);
                }
            }
            TransportEvent::StateChanged(connection_state) => {
                info!(
                    "Link {} connection state: {:?}",
                    self.remote.short(),
                    connection_state
                );
                if connection_state == ConnectionState::Failed {
                    let _ = self.restarts.send(generation);
                }
            }
            TransportEvent::ChannelOpen(channel) => {
                let mut state = self.state.lock().await;
                if state.closed || state.generation != generation {
                    drop(state);
                    channel.close().await;
                    return;
                }
                state.channel_state = ChannelState::Open;
                info!(
                    "Data channel '{}' to {} open",
                    channel.label(),
                    self.remote.short()
                );
                let _ = self.link_events.send(LinkEvent::ChannelOpen(channel));
            }
        }
    }

    /// Replace a failed connection with a fresh one
    async fn restart(self: &Arc<Self>, failed_generation: u64) {
        let old = {
            let mut state = self.state.lock().await;
            if state.closed || state.generation != failed_generation {
                return;
            }
            info!("Link to {} failed, rebuilding", self.remote.short());
            state.generation += 1;
            state.making_offer = false;
            state.candidate_queue.clear();
            let old = state.connection.take();
            if let Err(e) = self.install_connection(&mut state).await {
                warn!("Failed to rebuild link to {}: {}", self.remote.short(), e);
                state.channel_state = ChannelState::Closed;
            }
            old
        };

        if let Some(old) = old {
            old.close().await;
        }
        let _ = self.link_events.send(LinkEvent::ChannelLost);

        if self.role.is_initiator() {
            tokio::time::sleep(self.config.restart_delay).await;
            if let Err(e) = self.create_offer().await {
                warn!("Re-offer to {} failed: {}", self.remote.short(), e);
            }
        }
    }

    pub async fn close(&self) {
        let (connection, pump) = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.channel_state = ChannelState::Closed;
            state.candidate_queue.clear();
            (state.connection.take(), state.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
        debug!("Link to {} closed", self.remote.short());
    }
}

/// Rebuilds run here rather than on the event pump, which a rebuild replaces
async fn restart_loop(negotiator: Weak<LinkNegotiator>, mut failed: mpsc::UnboundedReceiver<u64>) {
    while let Some(generation) = failed.recv().await {
        let Some(negotiator) = negotiator.upgrade() else {
            break;
        };
        negotiator.restart(generation).await;
    }
}

async fn pump_events(
    negotiator: Weak<LinkNegotiator>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(negotiator) = negotiator.upgrade() else {
            break;
        };
        negotiator.on_transport_event(generation, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnectionFactory, MockNetwork, MockRelay};

    struct Side {
        negotiator: Arc<LinkNegotiator>,
        factory: Arc<MockConnectionFactory>,
        inbox: mpsc::UnboundedReceiver<SignalMessage>,
        links: mpsc::UnboundedReceiver<LinkEvent>,
        opened: usize,
        lost: usize,
    }

    impl Side {
        fn new(
            network: &Arc<MockNetwork>,
            relay: &Arc<MockRelay>,
            local: &str,
            remote: &str,
            restart_delay: Duration,
        ) -> Self {
            let local = ParticipantId::new(local);
            let factory = Arc::new(MockConnectionFactory::new(network.clone(), local.clone()));
            let (endpoint, inbox) = relay.endpoint(local.clone());
            let (tx, links) = mpsc::unbounded_channel();
            let negotiator = LinkNegotiator::new(
                local,
                ParticipantId::new(remote),
                RoomId::new("ROOM01"),
                factory.clone(),
                endpoint,
                NegotiatorConfig { restart_delay },
                tx,
            );
            Self {
                negotiator,
                factory,
                inbox,
                links,
                opened: 0,
                lost: 0,
            }
        }

        async fn deliver(&mut self) -> usize {
            let mut delivered = 0;
            while let Ok(msg) = self.inbox.try_recv() {
                if let Err(e) = self.negotiator.handle_signal(msg.payload).await {
                    debug!("signal dropped in test: {}", e);
                }
                delivered += 1;
            }
            delivered
        }

        fn poll_links(&mut self) {
            while let Ok(event) = self.links.try_recv() {
                match event {
                    LinkEvent::ChannelOpen(_) => self.opened += 1,
                    LinkEvent::ChannelLost => self.lost += 1,
                }
            }
        }
    }

    async fn exchange_until<F>(a: &mut Side, b: &mut Side, mut done: F)
    where
        F: FnMut(&Side, &Side) -> bool,
    {
        for _ in 0..400 {
            a.deliver().await;
            b.deliver().await;
            a.poll_links();
            b.poll_links();
            if done(a, b) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("negotiation did not settle");
    }

    fn pair(restart_delay: Duration) -> (Side, Side, Arc<MockNetwork>) {
        let network = MockNetwork::new();
        let relay = MockRelay::new();
        // "bob" > "alice": bob initiates, alice is polite
        let bob = Side::new(&network, &relay, "bob", "alice", restart_delay);
        let alice = Side::new(&network, &relay, "alice", "bob", restart_delay);
        (bob, alice, network)
    }

    #[tokio::test]
    async fn test_initiator_establishes_link() {
        let (mut bob, mut alice, network) = pair(Duration::from_millis(20));
        assert!(bob.negotiator.role().is_initiator());
        assert!(alice.negotiator.role().is_polite());

        alice.negotiator.start().await.unwrap();
        bob.negotiator.start().await.unwrap();
        exchange_until(&mut bob, &mut alice, |b, a| b.opened == 1 && a.opened == 1).await;

        assert_eq!(bob.negotiator.channel_state().await, ChannelState::Open);
        assert_eq!(alice.negotiator.channel_state().await, ChannelState::Open);
        assert_eq!(network.link_count(), 1);
        assert_eq!(
            bob.factory.connections_to(&ParticipantId::new("alice"))[0].data_channel_label(),
            Some(DATA_CHANNEL_LABEL.to_string())
        );
    }

    #[tokio::test]
    async fn test_glare_resolves_with_polite_rollback() {
        let (mut bob, mut alice, network) = pair(Duration::from_millis(20));
        bob.negotiator.start().await.unwrap();
        alice.negotiator.start().await.unwrap();
        // Both sides are mid-offer before either sees the other's offer
        alice.negotiator.create_offer().await.unwrap();
        assert_eq!(
            alice.negotiator.signaling_state().await,
            Some(SignalingState::HaveLocalOffer)
        );
        assert_eq!(
            bob.negotiator.signaling_state().await,
            Some(SignalingState::HaveLocalOffer)
        );

        // Polite side sees the impolite offer first and yields
        alice.deliver().await;
        assert_eq!(
            alice.negotiator.signaling_state().await,
            Some(SignalingState::Stable)
        );
        let alice_pc = &alice.factory.connections_to(&ParticipantId::new("bob"))[0];
        assert!(alice_pc.has_remote_description().await);

        exchange_until(&mut bob, &mut alice, |b, a| b.opened == 1 && a.opened == 1).await;
        assert_eq!(network.link_count(), 1);
        assert_eq!(
            bob.negotiator.signaling_state().await,
            Some(SignalingState::Stable)
        );
        // No rebuilds were needed
        assert_eq!(bob.factory.created_count(), 1);
        assert_eq!(alice.factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (_bob, alice, _network) = pair(Duration::from_millis(20));
        alice.negotiator.start().await.unwrap();

        let early = IceCandidate::new("candidate:early 1 udp 1 10.0.0.2 4000 typ host");
        alice
            .negotiator
            .handle_remote_candidate(early.clone())
            .await
            .unwrap();
        assert_eq!(alice.negotiator.queued_candidates().await, 1);

        alice
            .negotiator
            .handle_remote_offer("mock-offer 999".to_string())
            .await
            .unwrap();
        assert_eq!(alice.negotiator.queued_candidates().await, 0);
        let pc = &alice.factory.connections_to(&ParticipantId::new("bob"))[0];
        assert_eq!(pc.applied_candidates(), vec![early.clone()]);

        // Later candidates apply immediately
        let late = IceCandidate::new("candidate:late 1 udp 1 10.0.0.2 4001 typ host");
        alice
            .negotiator
            .handle_remote_candidate(late.clone())
            .await
            .unwrap();
        assert_eq!(pc.applied_candidates(), vec![early, late]);
    }

    #[tokio::test]
    async fn test_out_of_state_answer_is_discarded() {
        let (_bob, alice, _network) = pair(Duration::from_millis(20));
        alice.negotiator.start().await.unwrap();
        alice
            .negotiator
            .handle_remote_answer("mock-answer 42".to_string())
            .await
            .unwrap();
        assert_eq!(
            alice.negotiator.signaling_state().await,
            Some(SignalingState::Stable)
        );
    }

    #[tokio::test]
    async fn test_impolite_ignores_colliding_offer() {
        let (bob, _alice, _network) = pair(Duration::from_millis(20));
        bob.negotiator.start().await.unwrap();
        assert_eq!(
            bob.negotiator.signaling_state().await,
            Some(SignalingState::HaveLocalOffer)
        );
        bob.negotiator
            .handle_remote_offer("mock-offer 999".to_string())
            .await
            .unwrap();
        assert_eq!(
            bob.negotiator.signaling_state().await,
            Some(SignalingState::HaveLocalOffer)
        );
    }

    #[tokio::test]
    async fn test_failure_rebuilds_and_initiator_reoffers() {
        let (mut bob, mut alice, network) = pair(Duration::from_millis(30));
        alice.negotiator.start().await.unwrap();
        bob.negotiator.start().await.unwrap();
        exchange_until(&mut bob, &mut alice, |b, a| b.opened == 1 && a.opened == 1).await;

        assert_eq!(
            network.fail_link(&ParticipantId::new("bob"), &ParticipantId::new("alice")),
            1
        );
        exchange_until(&mut bob, &mut alice, |b, a| {
            b.lost == 1 && a.lost == 1 && b.opened == 2 && a.opened == 2
        })
        .await;

        assert_eq!(bob.negotiator.generation().await, 1);
        assert_eq!(alice.negotiator.generation().await, 1);
        assert_eq!(bob.factory.created_count(), 2);
        assert_eq!(alice.factory.created_count(), 2);
        assert_eq!(network.link_count(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_link() {
        let (mut bob, mut alice, network) = pair(Duration::from_millis(20));
        alice.negotiator.start().await.unwrap();
        bob.negotiator.start().await.unwrap();
        exchange_until(&mut bob, &mut alice, |b, a| b.opened == 1 && a.opened == 1).await;

        bob.negotiator.close().await;
        assert_eq!(bob.negotiator.channel_state().await, ChannelState::Closed);
        assert_eq!(network.link_count(), 0);
        assert!(matches!(
            bob.negotiator.create_offer().await,
            Err(NegotiationError::Closed)
        ));
    }
}
