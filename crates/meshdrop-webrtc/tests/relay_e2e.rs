//! Two sessions meeting through a real relay
//!
//! Signaling runs over WebSocket against a relay on an ephemeral port; the
//! peer connections themselves are the in-memory mocks.

use bytes::Bytes;
use meshdrop_room::{RegistryConfig, RelayEvent, RelayServer, RoomId};
use meshdrop_webrtc::mock::{MockConnectionFactory, MockNetwork};
use meshdrop_webrtc::{
    OutgoingFile, RelayClient, Session, SessionConfig, SessionEvent, SessionEventReceiver,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(RegistryConfig::default(), addr.to_string());
    tokio::spawn(server.serve(listener));
    format!("ws://{}/ws", addr)
}

async fn next_relay_event<F>(events: &mut UnboundedReceiver<RelayEvent>, mut pred: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("relay connection closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

async fn next_session_event<F>(events: &mut SessionEventReceiver, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("session closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Session driven by everything the relay pushes after room admission
fn attach(
    network: &Arc<MockNetwork>,
    relay: Arc<RelayClient>,
    mut relay_events: UnboundedReceiver<RelayEvent>,
    room: RoomId,
    admission: Option<RelayEvent>,
) -> (Arc<Session>, SessionEventReceiver) {
    let factory = Arc::new(MockConnectionFactory::new(network.clone(), relay.id().clone()));
    let (session, events) = Session::new(
        relay.id().clone(),
        room,
        factory,
        relay,
        SessionConfig::default(),
    );
    let driver = session.clone();
    tokio::spawn(async move {
        if let Some(event) = admission {
            driver.handle_relay_event(event).await;
        }
        while let Some(event) = relay_events.recv().await {
            driver.handle_relay_event(event).await;
        }
    });
    (session, events)
}

#[tokio::test]
async fn test_file_exchange_through_relay() {
    let url = start_relay().await;
    let network = MockNetwork::new();

    let (alice_relay, mut alice_relay_events) = RelayClient::connect(&url).await.unwrap();
    alice_relay.create_room(None).unwrap();
    let RelayEvent::RoomCreated { room_id, .. } =
        next_relay_event(&mut alice_relay_events, |e| {
            matches!(e, RelayEvent::RoomCreated { .. })
        })
        .await
    else {
        unreachable!()
    };
    let alice_id = alice_relay.id().clone();
    let (alice, mut alice_events) = attach(
        &network,
        alice_relay,
        alice_relay_events,
        room_id.clone(),
        None,
    );

    let (bob_relay, mut bob_relay_events) = RelayClient::connect(&url).await.unwrap();
    bob_relay.join_room(room_id.clone(), None).unwrap();
    let joined = next_relay_event(&mut bob_relay_events, |e| {
        matches!(e, RelayEvent::RoomJoined { .. })
    })
    .await;
    if let RelayEvent::RoomJoined { participants, .. } = &joined {
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].id, alice_id);
    }
    let bob_id = bob_relay.id().clone();
    let (bob, mut bob_events) = attach(
        &network,
        bob_relay,
        bob_relay_events,
        room_id,
        Some(joined),
    );

    next_session_event(&mut alice_events, |e| matches!(e, SessionEvent::LinkOpen { .. })).await;
    next_session_event(&mut bob_events, |e| matches!(e, SessionEvent::LinkOpen { .. })).await;
    assert_eq!(alice.connected_participants().await, vec![bob_id.clone()]);

    let data = Bytes::from(vec![7u8; 200_000]);
    let sender = alice.clone();
    let to = bob_id.clone();
    let file = OutgoingFile::from_bytes("photo.jpg", "image/jpeg", data.clone());
    let send = tokio::spawn(async move { sender.send_file(&to, file).await });

    let SessionEvent::IncomingOffer { participant, offer } =
        next_session_event(&mut bob_events, |e| {
            matches!(e, SessionEvent::IncomingOffer { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(participant, alice_id);
    assert_eq!(offer.file_size, 200_000);
    assert_eq!(offer.total_chunks, 4);
    bob.accept(&participant, &offer.transfer_id).await.unwrap();
    assert_eq!(send.await.unwrap().unwrap(), offer.transfer_id);

    let SessionEvent::FileReceived { file, .. } = next_session_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::FileReceived { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(file.file_name, "photo.jpg");
    assert_eq!(file.mime_type, "image/jpeg");
    assert!(file.data == data);
}
