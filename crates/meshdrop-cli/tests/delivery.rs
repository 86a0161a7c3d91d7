//! `--send` delivery over the in-memory network

use bytes::Bytes;
use meshdrop_cli::Deliveries;
use meshdrop_webrtc::mock::{MockConnectionFactory, MockNetwork, MockRelay};
use meshdrop_webrtc::{
    Direction, NegotiatorConfig, OutgoingFile, ParticipantId, RoomId, Session, SessionConfig,
    SessionEvent, SessionEventReceiver, TransferConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn session(
    network: &Arc<MockNetwork>,
    relay: &Arc<MockRelay>,
    name: &str,
) -> (ParticipantId, Arc<Session>, SessionEventReceiver) {
    let id = ParticipantId::new(name);
    let (endpoint, mut inbox) = relay.endpoint(id.clone());
    let factory = Arc::new(MockConnectionFactory::new(network.clone(), id.clone()));
    let config = SessionConfig {
        negotiator: NegotiatorConfig {
            restart_delay: Duration::from_millis(50),
        },
        transfer: TransferConfig::default(),
    };
    let (session, events) = Session::new(id.clone(), RoomId::new("ROOM01"), factory, endpoint, config);

    let pump = session.clone();
    tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            pump.handle_signal(msg).await;
        }
    });
    (id, session, events)
}

async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("session event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

#[tokio::test]
async fn test_files_are_offered_one_at_a_time_and_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let network = MockNetwork::new();
    let relay = MockRelay::new();
    let (alice_id, alice, mut alice_raw) = session(&network, &relay, "alice");
    let (bob_id, bob, mut bob_raw) = session(&network, &relay, "bob");

    let files = vec![
        OutgoingFile::from_bytes("first.txt", "text/plain", Bytes::from(vec![1u8; 150_000])),
        OutgoingFile::from_bytes("second.txt", "text/plain", Bytes::from_static(b"two")),
    ];
    let deliveries = Arc::new(Deliveries::new(alice.clone(), files));

    // Alice's events go through the router, then on to the test
    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    let router = deliveries.clone();
    tokio::spawn(async move {
        while let Some(event) = alice_raw.recv().await {
            router.route(&event);
            let _ = alice_tx.send(event);
        }
    });
    let (bob_tx, mut bob_events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = bob_raw.recv().await {
            let _ = bob_tx.send(event);
        }
    });

    alice.add_participant(bob_id.clone()).await.unwrap();
    bob.add_participant(alice_id.clone()).await.unwrap();

    let mut received = Vec::new();
    while received.len() < 2 {
        match next_event(&mut bob_events, |e| {
            matches!(
                e,
                SessionEvent::IncomingOffer { .. } | SessionEvent::FileReceived { .. }
            )
        })
        .await
        {
            SessionEvent::IncomingOffer { participant, offer } => {
                bob.accept(&participant, &offer.transfer_id).await.unwrap();
            }
            SessionEvent::FileReceived { file, .. } => received.push(file.file_name),
            _ => unreachable!(),
        }
    }
    assert_eq!(received, vec!["first.txt", "second.txt"]);

    tokio::time::timeout(Duration::from_secs(5), async {
        while deliveries.delivered(&bob_id) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deliveries not recorded");
    while let Ok(event) = alice_events.try_recv() {
        assert!(
            !matches!(
                event,
                SessionEvent::TransferFailed {
                    direction: Direction::Outgoing,
                    ..
                }
            ),
            "unexpected failure: {:?}",
            event
        );
    }

    // A rebuilt link must not bring the same files again
    assert_eq!(network.fail_link(&alice_id, &bob_id), 1);
    next_event(&mut alice_events, |e| {
        matches!(e, SessionEvent::LinkOpen { participant } if *participant == bob_id)
    })
    .await;
    let again = tokio::time::timeout(Duration::from_millis(500), async {
        loop {
            match bob_events.recv().await {
                Some(SessionEvent::IncomingOffer { offer, .. }) => return offer.file_name,
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(again.is_err(), "re-offered {:?}", again);
    assert_eq!(deliveries.delivered(&bob_id), 2);
}
