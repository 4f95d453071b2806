use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use peer_drop::signaling::relay_client::RelayClient;
use peer_drop::signaling::relay_server::{serve, RelayState};
use peer_drop::signaling::{EndpointId, IceCandidate, RelayEvent, SessionDescription, Signal, Signaler};

async fn start_relay() -> (String, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new();
    tokio::spawn(serve(listener, state.clone()));
    (format!("ws://{}", addr), state)
}

async fn next_event(rx: &mut mpsc::Receiver<RelayEvent>) -> RelayEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for relay event")
        .expect("relay event stream ended")
}

#[tokio::test]
async fn test_relay_membership_and_forwarding() {
    let (address, state) = start_relay().await;

    let (a, mut a_events) = RelayClient::connect(&address).await.unwrap();
    assert_eq!(
        next_event(&mut a_events).await,
        RelayEvent::Welcome {
            id: a.local_id().clone()
        }
    );
    assert_eq!(next_event(&mut a_events).await, RelayEvent::Peers(vec![]));

    let (b, mut b_events) = RelayClient::connect(&address).await.unwrap();
    assert_ne!(a.local_id(), b.local_id());
    assert!(matches!(next_event(&mut b_events).await, RelayEvent::Welcome { .. }));
    assert_eq!(
        next_event(&mut b_events).await,
        RelayEvent::Peers(vec![a.local_id().clone()])
    );
    assert_eq!(
        next_event(&mut a_events).await,
        RelayEvent::PeerJoined(b.local_id().clone())
    );
    assert_eq!(state.peer_count(), 2);

    let offer = SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n");
    a.send(Signal::Offer(offer.clone()), b.local_id()).await.unwrap();
    assert_eq!(
        next_event(&mut b_events).await,
        RelayEvent::Signal {
            from: a.local_id().clone(),
            signal: Signal::Offer(offer),
        }
    );

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    };
    b.send(Signal::IceCandidate(candidate.clone()), a.local_id())
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut a_events).await,
        RelayEvent::Signal {
            from: b.local_id().clone(),
            signal: Signal::IceCandidate(candidate),
        }
    );

    b.close().await;
    assert_eq!(
        next_event(&mut a_events).await,
        RelayEvent::PeerLeft(b.local_id().clone())
    );
}

#[tokio::test]
async fn test_signal_to_unknown_endpoint_is_dropped() {
    let (address, _state) = start_relay().await;

    let (a, mut a_events) = RelayClient::connect(&address).await.unwrap();
    next_event(&mut a_events).await;
    next_event(&mut a_events).await;

    a.send(
        Signal::Answer(SessionDescription::answer("v=0")),
        &EndpointId::from("nobody"),
    )
    .await
    .unwrap();

    // The relay keeps the connection open and routing still works
    let (b, mut b_events) = RelayClient::connect(&address).await.unwrap();
    next_event(&mut b_events).await;
    next_event(&mut b_events).await;
    a.send(Signal::Answer(SessionDescription::answer("v=1")), b.local_id())
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut b_events).await,
        RelayEvent::Signal { .. }
    ));
}
