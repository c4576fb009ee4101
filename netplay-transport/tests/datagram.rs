//! Integration tests for the datagram transport.
//!
//! Each test listens on a loopback port and drives both ends from the test
//! task (or runs an echo server in a background task) over real UDP sockets.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use netplay_transport::address::FamilyPreference;
use netplay_transport::packet::{flags, Packet};
use netplay_transport::session::{ReliableSession, SessionConfig};
use netplay_transport::simulator::FaultConfig;
use netplay_transport::state::TransportState;
use netplay_transport::timer::TimerConfig;
use netplay_transport::transport::{
    DisconnectReason, Protocol, Transport, TransportConfig, TransportError, TransportEvent,
};
use netplay_transport::NetworkAddress;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn timer() -> TimerConfig {
    TimerConfig::default()
        .with_initial_rto(Duration::from_millis(100))
        .with_min_rto(Duration::from_millis(50))
}

fn config() -> TransportConfig {
    TransportConfig::default()
        .with_preference(FamilyPreference::Ipv4Only)
        .with_tick_interval(Duration::from_millis(10))
        .with_connect_timeout(Duration::from_secs(3))
        .with_session(SessionConfig::default().with_timer(timer()))
}

async fn listen(config: TransportConfig) -> (Transport, NetworkAddress) {
    let server = Transport::listen(Protocol::Datagram, "127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("listen");
    let addr = server.address().clone();
    (server, addr)
}

async fn next(t: &mut Transport) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), t.next_event())
        .await
        .expect("event timed out")
        .expect("transport closed")
}

async fn echo(mut server: Transport) {
    while let Some(event) = server.next_event().await {
        if let TransportEvent::Message { from, payload } = event {
            server.send(&payload, Some(&from)).await;
        }
    }
}

/// Answer the first SYN on a bare socket and return the sender.
async fn answer_syn(far: &UdpSocket) -> SocketAddr {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = far.recv_from(&mut buf).await.unwrap();
        if Packet::decode(&buf[..n]).unwrap().is_syn() {
            far.send_to(&Packet::syn_ack().encode().unwrap(), from)
                .await
                .unwrap();
            return from;
        }
    }
}

/// Open a session from a bare socket: SYN out, `Accepted` and SYN|ACK back.
async fn open_from(far: &UdpSocket, server: &mut Transport) {
    let addr = server.local_addr().unwrap();
    far.send_to(&Packet::syn().encode().unwrap(), addr)
        .await
        .unwrap();
    assert!(matches!(next(server).await, TransportEvent::Accepted { .. }));
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, _) = far.recv_from(&mut buf).await.unwrap();
        if Packet::decode(&buf[..n]).unwrap().is_syn_ack() {
            return;
        }
    }
}

async fn expect_payload(t: &mut Transport, want: &[u8]) {
    match next(t).await {
        TransportEvent::Message { payload, .. } => assert_eq!(payload, want),
        other => panic!("expected {want:?}, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// The handshake reports the client to the listener, and messages flow
/// both ways tagged with their origin.
#[tokio::test]
async fn handshake_then_exchange() {
    let (mut server, addr) = listen(config()).await;

    let (client, accepted) = tokio::join!(
        Transport::connect(Protocol::Datagram, addr.clone(), config()),
        next(&mut server),
    );
    let mut client = client.expect("connect");
    assert_eq!(client.state(), TransportState::Connected);
    assert_eq!(client.address(), &addr);
    let TransportEvent::Accepted { peer } = accepted else {
        panic!("expected Accepted, got {accepted:?}");
    };
    assert_eq!(Some(peer.port()), client.local_addr().map(|a| a.port()));

    assert!(client.send(b"ping", None).await);
    match next(&mut server).await {
        TransportEvent::Message { from, payload } => {
            assert_eq!(from, peer);
            assert_eq!(payload, b"ping");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(server.send(b"pong", Some(&peer)).await);
    match next(&mut client).await {
        TransportEvent::Message { payload, .. } => assert_eq!(payload, b"pong"),
        other => panic!("unexpected {other:?}"),
    }
}

/// Messages arrive once and in order even when a third of the client's
/// datagrams are dropped.
#[tokio::test]
async fn ordered_delivery_under_loss() {
    let (server, addr) = listen(config()).await;
    let server_task = tokio::spawn(echo(server));

    let lossy = config().with_faults(FaultConfig::default().with_packet_loss(30).with_seed(7));
    let mut client = Transport::connect(Protocol::Datagram, addr, lossy)
        .await
        .expect("connect");

    for i in 0..20u8 {
        assert!(client.send(&[i], None).await);
    }
    let mut got = Vec::new();
    while got.len() < 20 {
        match next(&mut client).await {
            TransportEvent::Message { payload, .. } => got.extend(payload),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(got, (0..20u8).collect::<Vec<_>>());
    server_task.abort();
}

/// Sends beyond the window are held back and drained as ACKs arrive.
#[tokio::test]
async fn backlog_drains_past_window() {
    let (server, addr) = listen(config()).await;
    let server_task = tokio::spawn(echo(server));

    let small = config().with_session(
        SessionConfig::default()
            .with_window_size(2)
            .with_timer(timer()),
    );
    let mut client = Transport::connect(Protocol::Datagram, addr, small)
        .await
        .expect("connect");

    for i in 0..10u8 {
        assert!(client.send(&[i], None).await);
    }
    let mut got = Vec::new();
    while got.len() < 10 {
        if let TransportEvent::Message { payload, .. } = next(&mut client).await {
            got.extend(payload);
        }
    }
    assert_eq!(got, (0..10u8).collect::<Vec<_>>());
    server_task.abort();
}

/// FIN evicts the client's session on the server; the listener stays up.
#[tokio::test]
async fn disconnect_notifies_peer() {
    let (mut server, addr) = listen(config()).await;
    let (client, _) = tokio::join!(
        Transport::connect(Protocol::Datagram, addr, config()),
        next(&mut server),
    );
    let mut client = client.expect("connect");

    client.disconnect().await;
    assert_eq!(client.state(), TransportState::Disconnected);
    assert!(!client.send(b"late", None).await);
    assert!(client.next_event().await.is_none());
    client.disconnect().await;

    match next(&mut server).await {
        TransportEvent::Disconnected { reason, .. } => assert_eq!(reason, DisconnectReason::Closed),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.state(), TransportState::Listening);
}

/// A connect with nobody listening fails within the connect timeout.
#[tokio::test]
async fn connect_times_out() {
    let (mut server, addr) = listen(config()).await;
    server.disconnect().await;

    let short = config().with_connect_timeout(Duration::from_millis(300));
    let started = tokio::time::Instant::now();
    let result = Transport::connect(Protocol::Datagram, addr, short).await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(3));
}

/// Datagram peers are served in place; there is never anything to accept.
#[tokio::test]
async fn accept_is_invalid_on_datagram_listener() {
    let (mut server, _) = listen(config()).await;
    match server.accept().await {
        Err(TransportError::InvalidState { state, .. }) => {
            assert_eq!(state, TransportState::Listening)
        }
        other => panic!("unexpected {:?}", other.map(|t| t.state())),
    }
}

/// Once the window and the backlog are both full, `send` refuses.
#[tokio::test]
async fn send_refuses_when_backlog_is_full() {
    let far = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let far_addr = far.local_addr().unwrap();
    let tight = config()
        .with_max_backlog(2)
        .with_session(SessionConfig::default().with_window_size(1).with_timer(timer()));

    let (client, _) = tokio::join!(
        Transport::connect(Protocol::Datagram, far_addr.into(), tight),
        answer_syn(&far),
    );
    let mut client = client.expect("connect");

    assert!(client.send(b"in flight", None).await);
    assert!(client.send(b"queued 1", None).await);
    assert!(client.send(b"queued 2", None).await);
    assert!(!client.send(b"refused", None).await);
    if let Transport::Datagram(t) = &client {
        assert_eq!(t.backlog_len(&NetworkAddress::from(far_addr)), 2);
    }
}

/// A reorder buffer too small for the gap drops its oldest entry; the
/// retransmission fills it and delivery stays in order and exactly once.
#[tokio::test]
async fn reorder_overflow_recovers_in_order() {
    let small = config().with_session(
        SessionConfig::default()
            .with_reorder_capacity(2)
            .with_timer(timer()),
    );
    let (mut server, _) = listen(small).await;
    let server_addr = server.local_addr().unwrap();
    let far = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    open_from(&far, &mut server).await;

    let mut session = ReliableSession::new(SessionConfig::default());
    let datagrams: Vec<Vec<u8>> = (0u8..5)
        .map(|i| session.submit(&[b'm', b'0' + i]).unwrap().datagram)
        .collect();
    // 3 and 4 are buffered, then 1 evicts 3.
    for i in [3, 4, 1, 0, 2] {
        far.send_to(&datagrams[i], server_addr).await.unwrap();
    }
    for want in [b"m0", b"m1", b"m2"] {
        expect_payload(&mut server, want).await;
    }

    // Resending 3 releases the buffered 4 as well.
    far.send_to(&datagrams[3], server_addr).await.unwrap();
    expect_payload(&mut server, b"m3").await;
    expect_payload(&mut server, b"m4").await;

    let mut buf = vec![0u8; 2048];
    let mut highest = None;
    while highest != Some(4) {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), far.recv_from(&mut buf))
            .await
            .expect("no ack")
            .unwrap();
        let packet = Packet::decode(&buf[..n]).unwrap();
        if packet.header.has(flags::ACK) {
            highest = Some(packet.header.ack);
        }
    }
}
