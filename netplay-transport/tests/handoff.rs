//! Integration tests for handing a live datagram transport to a new owner.
//!
//! The far end is a bare UDP socket driven by the test, with a
//! [`ReliableSession`] of its own where it needs to send data.
#![cfg(unix)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use netplay_transport::address::FamilyPreference;
use netplay_transport::handoff::{FdBroker, SessionHandoff};
use netplay_transport::packet::{flags, Packet};
use netplay_transport::session::{ReliableSession, SessionConfig};
use netplay_transport::state::TransportState;
use netplay_transport::timer::TimerConfig;
use netplay_transport::transport::{Protocol, Transport, TransportConfig, TransportEvent};

fn config() -> TransportConfig {
    TransportConfig::default()
        .with_preference(FamilyPreference::Ipv4Only)
        .with_raw(true)
        .with_tick_interval(Duration::from_millis(10))
        .with_connect_timeout(Duration::from_secs(3))
        .with_session(
            SessionConfig::default()
                .with_timer(TimerConfig::default().with_initial_rto(Duration::from_millis(300))),
        )
}

/// Answer the client's SYN and return its address.
async fn accept_syn(far: &UdpSocket) -> SocketAddr {
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

/// Collect `count` DATA packets as `(seq, payload)`, ignoring pure ACKs.
async fn collect_data(far: &UdpSocket, count: usize) -> Vec<(u32, Vec<u8>)> {
    let mut buf = vec![0u8; 2048];
    let mut out = Vec::new();
    while out.len() < count {
        let (n, _) = far.recv_from(&mut buf).await.unwrap();
        let packet = Packet::decode(&buf[..n]).unwrap();
        if packet.header.has(flags::DATA) {
            out.push((packet.header.seq, packet.payload));
        }
    }
    out
}

async fn next(t: &mut Transport) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), t.next_event())
        .await
        .expect("event timed out")
        .expect("transport closed")
}

/// The client keeps three messages in flight (the far end never
/// acknowledges) and 200 received bytes unconsumed across the handoff.
#[tokio::test]
async fn resumed_transport_keeps_buffer_and_unacked_window() {
    let far = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let far_addr = far.local_addr().unwrap();

    let (client, client_addr) = tokio::join!(
        Transport::connect(Protocol::Datagram, far_addr.into(), config()),
        accept_syn(&far),
    );
    let mut client = client.expect("connect");

    // Three messages the far end never acknowledges.
    for msg in [&b"m0"[..], b"m1", b"m2"] {
        assert!(client.send(msg, None).await);
    }
    let first = collect_data(&far, 3).await;
    assert_eq!(
        first,
        vec![(0, b"m0".to_vec()), (1, b"m1".to_vec()), (2, b"m2".to_vec())]
    );

    // 200 bytes for the client to buffer and leave unconsumed.
    let mut far_session = ReliableSession::new(SessionConfig::default());
    let sub = far_session.submit(&[0xab; 200]).unwrap();
    far.send_to(&sub.datagram, client_addr).await.unwrap();
    match next(&mut client).await {
        TransportEvent::RawData { bytes, .. } => assert_eq!(bytes, vec![0xab; 200]),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(client.buffered().len(), 200);

    let envelope = SessionHandoff::produce(&client, &FdBroker)
        .expect("produce")
        .encode()
        .expect("encode");
    drop(client);

    let handoff = SessionHandoff::decode(&envelope).expect("decode");
    assert_eq!(handoff.sessions.len(), 1);
    let mut resumed = handoff.resume(&FdBroker, config()).expect("resume");
    assert_eq!(resumed.state(), TransportState::Connected);
    assert!(resumed.is_raw());

    // The buffered bytes come back on the first receive.
    match next(&mut resumed).await {
        TransportEvent::RawData { bytes, .. } => assert_eq!(bytes, vec![0xab; 200]),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(resumed.consume(200), 200);

    // The same three messages are retransmitted when the timer expires.
    let drive = tokio::time::timeout(Duration::from_millis(1500), resumed.next_event());
    let retransmitted = tokio::time::timeout(Duration::from_secs(3), collect_data(&far, 3));
    let (_, retransmitted) = tokio::join!(drive, retransmitted);
    assert_eq!(retransmitted.expect("no retransmission"), first);
}

/// Messages delivered together but not yet returned by `next_event` are
/// returned by the resumed transport, in order.
#[tokio::test]
async fn queued_messages_survive_handoff() {
    let framed = config().with_raw(false);
    let local = "127.0.0.1:0".parse().unwrap();
    let mut server = Transport::listen(Protocol::Datagram, local, framed.clone())
        .await
        .expect("listen");
    let server_addr = server.local_addr().unwrap();

    let far = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    far.send_to(&Packet::syn().encode().unwrap(), server_addr)
        .await
        .unwrap();
    assert!(matches!(next(&mut server).await, TransportEvent::Accepted { .. }));

    // m1 and m2 wait in the reorder buffer until m0 releases all three.
    let mut far_session = ReliableSession::new(SessionConfig::default());
    let datagrams: Vec<Vec<u8>> = [&b"m0"[..], b"m1", b"m2"]
        .iter()
        .map(|m| far_session.submit(m).unwrap().datagram)
        .collect();
    for i in [1, 2, 0] {
        far.send_to(&datagrams[i], server_addr).await.unwrap();
    }
    match next(&mut server).await {
        TransportEvent::Message { payload, .. } => assert_eq!(payload, b"m0"),
        other => panic!("unexpected {other:?}"),
    }

    let handoff = SessionHandoff::produce(&server, &FdBroker).expect("produce");
    assert_eq!(handoff.events.len(), 2);
    let envelope = handoff.encode().expect("encode");
    drop(server);

    let mut resumed = SessionHandoff::decode(&envelope)
        .expect("decode")
        .resume(&FdBroker, framed)
        .expect("resume");
    assert_eq!(resumed.state(), TransportState::Listening);
    for want in [b"m1", b"m2"] {
        match next(&mut resumed).await {
            TransportEvent::Message { payload, .. } => assert_eq!(payload, want),
            other => panic!("unexpected {other:?}"),
        }
    }
}
