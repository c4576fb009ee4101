//! Integration tests for path selection in the smart transport.

use std::time::Duration;

use netplay_transport::address::FamilyPreference;
use netplay_transport::relay::RelayServer;
use netplay_transport::selector::Strategy;
use netplay_transport::session::SessionConfig;
use netplay_transport::state::TransportState;
use netplay_transport::timer::TimerConfig;
use netplay_transport::transport::{
    Protocol, Transport, TransportConfig, TransportError, TransportEvent,
};
use netplay_transport::NetworkAddress;

fn config() -> TransportConfig {
    TransportConfig::default()
        .with_preference(FamilyPreference::Ipv4Only)
        .with_tick_interval(Duration::from_millis(10))
        .with_connect_timeout(Duration::from_secs(2))
        .with_session(
            SessionConfig::default()
                .with_timer(TimerConfig::default().with_initial_rto(Duration::from_millis(100))),
        )
}

fn loopback() -> NetworkAddress {
    "127.0.0.1:0".parse().unwrap()
}

async fn next(t: &mut Transport) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), t.next_event())
        .await
        .expect("event timed out")
        .expect("transport closed")
}

fn strategy(t: &Transport) -> Option<Strategy> {
    match t {
        Transport::Smart(s) => s.strategy(),
        _ => None,
    }
}

async fn expect_message(t: &mut Transport, expected: &[u8]) -> NetworkAddress {
    loop {
        match next(t).await {
            TransportEvent::Message { from, payload } => {
                assert_eq!(payload, expected);
                return from;
            }
            TransportEvent::Accepted { .. } => continue,
            other => panic!("unexpected {other:?}"),
        }
    }
}

/// With a smart listener on the other side the datagram path wins.
#[tokio::test]
async fn direct_datagram_is_preferred() {
    let mut server = Transport::listen(Protocol::Smart, loopback(), config())
        .await
        .expect("listen");
    let addr = server.address().clone();

    let (client, accepted) = tokio::join!(
        Transport::connect(Protocol::Smart, addr, config()),
        next(&mut server),
    );
    let mut client = client.expect("connect");
    assert!(matches!(accepted, TransportEvent::Accepted { .. }));
    assert_eq!(strategy(&client), Some(Strategy::Datagram));
    assert_eq!(server.pending_accepts(), 0);

    assert!(client.send(b"ping", None).await);
    let from = expect_message(&mut server, b"ping").await;
    assert!(server.send(b"pong", Some(&from)).await);
    expect_message(&mut client, b"pong").await;
}

/// A plain stream listener never answers the datagram handshake, so the
/// smart client falls back to TCP.
#[tokio::test]
async fn falls_back_to_stream() {
    let mut server = Transport::listen(Protocol::Stream, loopback(), config())
        .await
        .expect("listen");
    let addr = server.address().clone();

    let quick = config().with_connect_timeout(Duration::from_millis(300));
    let mut client = Transport::connect(Protocol::Smart, addr, quick)
        .await
        .expect("connect");
    assert_eq!(strategy(&client), Some(Strategy::Stream));

    let mut conn = server.accept().await.expect("accept");
    assert!(client.send(b"over tcp", None).await);
    // The hello frame is skipped by the plain stream reader.
    expect_message(&mut conn, b"over tcp").await;
}

/// Forced relaying tunnels through the relay and the acceptor learns it.
#[tokio::test]
async fn forced_relay_reaches_smart_listener() {
    let relay = RelayServer::bind(&loopback(), &config()).await.expect("relay");
    let relay_addr = NetworkAddress::from(relay.local_addr().unwrap());
    let relay_task = tokio::spawn(relay.run());

    let mut server = Transport::listen(Protocol::Smart, loopback(), config())
        .await
        .expect("listen");
    let addr = server.address().clone();

    let relayed = config()
        .with_relays(vec![relay_addr.clone()])
        .with_force_relay(true);
    let mut client = Transport::connect(Protocol::Smart, addr.clone(), relayed)
        .await
        .expect("connect");
    assert_eq!(strategy(&client), Some(Strategy::Relay));
    assert_eq!(client.address(), &addr);
    if let Transport::Smart(s) = &client {
        assert_eq!(s.relay(), Some(&relay_addr));
    }

    assert!(matches!(next(&mut server).await, TransportEvent::Accepted { .. }));
    let mut conn = server.accept().await.expect("accept");
    assert_eq!(strategy(&conn), Some(Strategy::Relay));
    assert_eq!(conn.state(), TransportState::Connected);

    assert!(client.send(b"via relay", None).await);
    expect_message(&mut conn, b"via relay").await;
    assert!(conn.send(b"and back", None).await);
    expect_message(&mut client, b"and back").await;
    relay_task.abort();
}

/// No path at all is an error listing how many attempts were made.
#[tokio::test]
async fn unreachable_without_paths() {
    let mut server = Transport::listen(Protocol::Stream, loopback(), config())
        .await
        .expect("listen");
    let addr = server.address().clone();
    server.disconnect().await;

    let quick = config().with_connect_timeout(Duration::from_millis(200));
    match Transport::connect(Protocol::Smart, addr, quick).await {
        Err(TransportError::Unreachable { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("unexpected {other:?}"),
    }
}
