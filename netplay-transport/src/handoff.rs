//! Hand a live transport to another process.
//!
//! [`SessionHandoff::produce`] captures everything a transport holds (its
//! buffered bytes and read cursor, every per-peer Go-Back-N session, events
//! not yet returned by `next_event`, and duplication tokens for its sockets
//! including accepted connections not yet taken) without disturbing the
//! original.  [`SessionHandoff::resume`] rebuilds an equivalent transport
//! from it.  Unacknowledged messages stay unacknowledged and are
//! retransmitted when their timer expires; buffered bytes come back on the
//! first receive and queued events are returned before anything new.
//!
//! # Envelope
//!
//! ```text
//!  "NPHO" | version u8 | protocol u8 | role u8 | strategy u8 | relay?
//!  address | peer | state u8 | raw u8 | connect timeout u64 (µs)
//!  read cursor u32 | buffered bytes | remote?
//!  socket count u8 | (kind u8, token bytes)*
//!  session count u32 | (peer, target text, snapshot bytes, backlog)*
//!  event count u32 | (kind u8, peer, payload bytes | reason)*
//! ```
//!
//! Pending connections travel as `PendingStream` sockets, in accept order.
//!
//! The original transport must not be used (or disconnected, which would
//! send FIN) after a handoff; drop it once the tokens are delivered.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::address::NetworkAddress;
use crate::datagram::{DatagramTransport, PeerLink};
use crate::frame::ReadBuffer;
use crate::selector::Strategy;
use crate::session::{ReliableSession, SessionError};
use crate::simulator::FaultInjector;
use crate::smart::{SmartDelegate, SmartListener, SmartTransport};
use crate::socket::DatagramSocket;
use crate::state::TransportState;
use crate::stream::{StreamEndpoint, StreamTransport};
use crate::timer::micros;
use crate::transport::{
    DisconnectReason, Protocol, Role, Transport, TransportConfig, TransportEvent,
};
use crate::wire::{Reader, WireError, Writer};

const MAGIC: &[u8; 4] = b"NPHO";
const VERSION: u8 = 2;
const NO_STRATEGY: u8 = 0xff;

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("cannot hand off a transport that is {state}")]
    InvalidState { state: TransportState },
    #[error("not a handoff envelope")]
    BadMagic,
    #[error("unsupported handoff version {0}")]
    UnsupportedVersion(u8),
    #[error("handoff carries no {0:?} socket")]
    MissingSocket(SocketKind),
    #[error("malformed socket token")]
    BadToken,
    #[error("{field} does not fit the envelope ({len})")]
    TooLarge { field: &'static str, len: usize },
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("session snapshot: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Socket duplication
// ---------------------------------------------------------------------------

/// Opaque bytes that let a [`SocketBroker`] reproduce a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareToken(Vec<u8>);

impl ShareToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Duplicates OS socket handles across a process boundary.
pub trait SocketBroker {
    fn share(&self, socket: BorrowedFd<'_>) -> Result<ShareToken, HandoffError>;

    /// Each token may be redeemed once.
    fn redeem(&self, token: &ShareToken) -> Result<OwnedFd, HandoffError>;
}

/// Duplicates the file descriptor; the token is its number.
///
/// The duplicate is close-on-exec.  Hand it to another process with
/// `SCM_RIGHTS`, or clear the flag before `exec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FdBroker;

impl SocketBroker for FdBroker {
    fn share(&self, socket: BorrowedFd<'_>) -> Result<ShareToken, HandoffError> {
        let fd: RawFd = socket.try_clone_to_owned()?.into_raw_fd();
        log::debug!("[handoff] duplicated socket as fd {fd}");
        Ok(ShareToken(fd.to_be_bytes().to_vec()))
    }

    fn redeem(&self, token: &ShareToken) -> Result<OwnedFd, HandoffError> {
        let raw: [u8; 4] = token
            .as_bytes()
            .try_into()
            .map_err(|_| HandoffError::BadToken)?;
        let fd = RawFd::from_be_bytes(raw);
        if fd < 0 {
            return Err(HandoffError::BadToken);
        }
        // SAFETY: `share` leaked this descriptor out of an `OwnedFd`; the
        // token is its only owner and is redeemed once.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Udp,
    TcpStream,
    TcpListener,
    /// Accepted by a listener, not yet handed out by `accept`.
    PendingStream,
}

impl SocketKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::Udp => 0,
            Self::TcpStream => 1,
            Self::TcpListener => 2,
            Self::PendingStream => 3,
        }
    }

    fn from_wire(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Udp),
            1 => Ok(Self::TcpStream),
            2 => Ok(Self::TcpListener),
            3 => Ok(Self::PendingStream),
            _ => Err(invalid("socket kind", v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSocket {
    pub kind: SocketKind,
    pub token: ShareToken,
}

/// One peer's Go-Back-N session as captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer: NetworkAddress,
    pub target: SocketAddr,
    /// [`ReliableSession::serialize`] output.
    pub session: Vec<u8>,
    pub backlog: Vec<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// SessionHandoff
// ---------------------------------------------------------------------------

/// Everything needed to rebuild a live transport elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandoff {
    pub protocol: Protocol,
    pub role: Role,
    /// Path a smart transport settled on; `None` for a smart listener.
    pub strategy: Option<Strategy>,
    pub relay: Option<NetworkAddress>,
    pub address: NetworkAddress,
    /// Other end of a stream connection.
    pub peer: NetworkAddress,
    pub state: TransportState,
    pub buffered: Vec<u8>,
    pub read_pos: usize,
    pub raw: bool,
    pub connect_timeout: Duration,
    /// Session key of a datagram client's remote.
    pub remote: Option<NetworkAddress>,
    pub sockets: Vec<SharedSocket>,
    pub sessions: Vec<PeerSnapshot>,
    /// Events the original had queued but not yet returned.
    pub events: Vec<TransportEvent>,
}

impl SessionHandoff {
    fn base(
        protocol: Protocol,
        role: Role,
        address: &NetworkAddress,
        state: TransportState,
        buffer: &ReadBuffer,
        config: &TransportConfig,
    ) -> Self {
        Self {
            protocol,
            role,
            strategy: None,
            relay: None,
            address: address.clone(),
            peer: address.clone(),
            state,
            buffered: buffer.bytes().to_vec(),
            read_pos: buffer.pos(),
            raw: config.raw,
            connect_timeout: config.connect_timeout,
            remote: None,
            sockets: Vec::new(),
            sessions: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Capture a connected or listening transport.
    pub fn produce(transport: &Transport, broker: &dyn SocketBroker) -> Result<Self, HandoffError> {
        let state = transport.state();
        if !state.is_live() {
            return Err(HandoffError::InvalidState { state });
        }
        let handoff = match transport {
            Transport::Stream(t) => Self::capture_stream(Protocol::Stream, t, broker)?,
            Transport::Datagram(t) => Self::capture_datagram(Protocol::Datagram, t, broker)?,
            Transport::Smart(s) => {
                let mut h = match &s.delegate {
                    SmartDelegate::Datagram(t) => {
                        Self::capture_datagram(Protocol::Smart, t, broker)?
                    }
                    SmartDelegate::Stream(t) => Self::capture_stream(Protocol::Smart, t, broker)?,
                    SmartDelegate::Listener(l) => {
                        let mut h = Self::capture_datagram(Protocol::Smart, &l.datagram, broker)?;
                        if let Some(tcp) = &l.tcp {
                            h.sockets.push(SharedSocket {
                                kind: SocketKind::TcpListener,
                                token: broker.share(tcp.as_fd())?,
                            });
                        }
                        h.share_pending(&l.pending, broker)?;
                        h
                    }
                };
                h.address = s.address.clone();
                h.strategy = s.strategy;
                h.relay = s.relay.clone();
                h
            }
        };
        log::info!(
            "[handoff] captured {} transport {} ({} session(s), {} event(s), {} buffered byte(s))",
            handoff.protocol,
            handoff.address,
            handoff.sessions.len(),
            handoff.events.len(),
            handoff.buffered.len() - handoff.read_pos
        );
        Ok(handoff)
    }

    fn capture_stream(
        protocol: Protocol,
        t: &StreamTransport,
        broker: &dyn SocketBroker,
    ) -> Result<Self, HandoffError> {
        let mut h = Self::base(protocol, t.role, &t.address, t.state, &t.buffer, &t.config);
        h.peer = t.peer.clone();
        let (kind, fd) = match &t.endpoint {
            StreamEndpoint::Connection(s) => (SocketKind::TcpStream, s.as_fd()),
            StreamEndpoint::Listener(l) => (SocketKind::TcpListener, l.as_fd()),
            StreamEndpoint::Closed => return Err(HandoffError::InvalidState { state: t.state }),
        };
        h.sockets.push(SharedSocket {
            kind,
            token: broker.share(fd)?,
        });
        h.share_pending(&t.pending, broker)?;
        h.events = t.events.iter().cloned().collect();
        Ok(h)
    }

    fn share_pending(
        &mut self,
        pending: &VecDeque<(tokio::net::TcpStream, SocketAddr)>,
        broker: &dyn SocketBroker,
    ) -> Result<(), HandoffError> {
        for (stream, _) in pending {
            self.sockets.push(SharedSocket {
                kind: SocketKind::PendingStream,
                token: broker.share(stream.as_fd())?,
            });
        }
        Ok(())
    }

    fn capture_datagram(
        protocol: Protocol,
        t: &DatagramTransport,
        broker: &dyn SocketBroker,
    ) -> Result<Self, HandoffError> {
        let mut h = Self::base(protocol, t.role, &t.address, t.state, &t.buffer, &t.config);
        let socket = t
            .socket
            .as_ref()
            .ok_or(HandoffError::InvalidState { state: t.state })?;
        h.sockets.push(SharedSocket {
            kind: SocketKind::Udp,
            token: broker.share(socket.inner().as_fd())?,
        });
        h.remote = t.remote.clone();
        h.sessions = t
            .peers
            .iter()
            .map(|(peer, link)| PeerSnapshot {
                peer: peer.clone(),
                target: link.target,
                session: link.session.serialize(),
                backlog: link.backlog.iter().cloned().collect(),
            })
            .collect();
        h.events = t.events.iter().cloned().collect();
        Ok(h)
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Rebuild the transport.  Must run inside a tokio runtime.
    ///
    /// The raw flag and connect timeout come from the handoff; everything
    /// else in `config` applies to the resumed transport.
    pub fn resume(
        self,
        broker: &dyn SocketBroker,
        config: TransportConfig,
    ) -> Result<Transport, HandoffError> {
        let config = config
            .with_raw(self.raw)
            .with_connect_timeout(self.connect_timeout);
        let transport = match (self.protocol, self.strategy) {
            (Protocol::Stream, _) => Transport::Stream(self.restore_stream(broker, config)?),
            (Protocol::Datagram, _) => Transport::Datagram(self.restore_datagram(broker, config)?),
            (Protocol::Smart, strategy) => {
                let delegate = match strategy {
                    Some(Strategy::Datagram) => {
                        SmartDelegate::Datagram(self.restore_datagram(broker, config.clone())?)
                    }
                    Some(Strategy::Stream | Strategy::Relay) => {
                        SmartDelegate::Stream(self.restore_stream(broker, config.clone())?)
                    }
                    None => {
                        let datagram = self.restore_datagram(broker, config.clone())?;
                        let tcp = match self.redeem(SocketKind::TcpListener, broker) {
                            Ok(fd) => Some(tcp_listener(fd)?),
                            Err(HandoffError::MissingSocket(_)) => None,
                            Err(e) => return Err(e),
                        };
                        let mut listener = SmartListener::new(datagram, tcp);
                        listener.pending = self.redeem_pending(broker)?;
                        SmartDelegate::Listener(listener)
                    }
                };
                Transport::Smart(SmartTransport {
                    address: self.address.clone(),
                    strategy,
                    relay: self.relay.clone(),
                    delegate,
                    config,
                })
            }
        };
        log::info!(
            "[handoff] resumed {} transport {} ({})",
            self.protocol,
            self.address,
            transport.state()
        );
        Ok(transport)
    }

    fn redeem(&self, kind: SocketKind, broker: &dyn SocketBroker) -> Result<OwnedFd, HandoffError> {
        let shared = self
            .sockets
            .iter()
            .find(|s| s.kind == kind)
            .ok_or(HandoffError::MissingSocket(kind))?;
        broker.redeem(&shared.token)
    }

    fn redeem_pending(
        &self,
        broker: &dyn SocketBroker,
    ) -> Result<VecDeque<(tokio::net::TcpStream, SocketAddr)>, HandoffError> {
        let mut pending = VecDeque::new();
        for shared in self.sockets.iter().filter(|s| s.kind == SocketKind::PendingStream) {
            let stream = std::net::TcpStream::from(broker.redeem(&shared.token)?);
            stream.set_nonblocking(true)?;
            let stream = tokio::net::TcpStream::from_std(stream)?;
            let from = stream.peer_addr()?;
            pending.push_back((stream, from));
        }
        Ok(pending)
    }

    fn buffer(&self) -> ReadBuffer {
        ReadBuffer::from_parts(self.buffered.clone(), self.read_pos)
    }

    fn restore_stream(
        &self,
        broker: &dyn SocketBroker,
        config: TransportConfig,
    ) -> Result<StreamTransport, HandoffError> {
        let endpoint = match self.redeem(SocketKind::TcpStream, broker) {
            Ok(fd) => {
                let stream = std::net::TcpStream::from(fd);
                stream.set_nonblocking(true)?;
                StreamEndpoint::Connection(tokio::net::TcpStream::from_std(stream)?)
            }
            Err(HandoffError::MissingSocket(_)) => StreamEndpoint::Listener(tcp_listener(
                self.redeem(SocketKind::TcpListener, broker)?,
            )?),
            Err(e) => return Err(e),
        };
        let mut t = StreamTransport::with_endpoint(
            self.role,
            self.address.clone(),
            self.peer.clone(),
            self.state,
            endpoint,
            config,
        );
        t.buffer = self.buffer();
        t.pending = self.redeem_pending(broker)?;
        t.events = self.events.iter().cloned().collect();
        t.rearm();
        Ok(t)
    }

    fn restore_datagram(
        &self,
        broker: &dyn SocketBroker,
        config: TransportConfig,
    ) -> Result<DatagramTransport, HandoffError> {
        let udp = std::net::UdpSocket::from(self.redeem(SocketKind::Udp, broker)?);
        let socket = DatagramSocket::from_std(udp, FaultInjector::new(config.faults))?;
        let mut t = DatagramTransport::with_socket(
            self.role,
            self.address.clone(),
            self.state,
            socket,
            config,
        );
        for snap in &self.sessions {
            let link = PeerLink {
                session: ReliableSession::deserialize(&snap.session)?,
                target: snap.target,
                backlog: snap.backlog.iter().cloned().collect(),
            };
            t.peers.insert(snap.peer.clone(), link);
        }
        t.remote = self.remote.clone();
        t.raw_from = self.remote.clone();
        t.buffer = self.buffer();
        t.raw_ready = t.config.raw && !t.buffer.is_empty();
        t.events = self.events.iter().cloned().collect();
        Ok(t)
    }

    // -----------------------------------------------------------------------
    // Envelope
    // -----------------------------------------------------------------------

    /// Fails only when a count outgrows its field.
    pub fn encode(&self) -> Result<Vec<u8>, HandoffError> {
        let mut w = Writer::new();
        for b in MAGIC {
            w.u8(*b);
        }
        w.u8(VERSION)
            .u8(self.protocol.to_wire())
            .u8(role_to_wire(self.role))
            .u8(self.strategy.map_or(NO_STRATEGY, Strategy::to_wire));
        write_optional(&mut w, self.relay.as_ref());
        self.address.write_to(&mut w);
        self.peer.write_to(&mut w);
        w.u8(self.state.to_wire())
            .bool(self.raw)
            .u64(micros(self.connect_timeout))
            .u32(fits("read cursor", self.read_pos)?)
            .bytes(&self.buffered);
        write_optional(&mut w, self.remote.as_ref());

        w.u8(fits("socket count", self.sockets.len())?);
        for s in &self.sockets {
            w.u8(s.kind.to_wire()).bytes(s.token.as_bytes());
        }
        w.u32(fits("session count", self.sessions.len())?);
        for snap in &self.sessions {
            snap.peer.write_to(&mut w);
            w.text(&snap.target.to_string())
                .bytes(&snap.session)
                .u32(fits("backlog length", snap.backlog.len())?);
            for msg in &snap.backlog {
                w.bytes(msg);
            }
        }
        w.u32(fits("event count", self.events.len())?);
        for event in &self.events {
            write_event(&mut w, event);
        }
        Ok(w.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HandoffError> {
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(HandoffError::BadMagic);
        }
        let mut r = Reader::new(&bytes[MAGIC.len()..]);
        let version = r.u8()?;
        if version != VERSION {
            return Err(HandoffError::UnsupportedVersion(version));
        }
        let protocol = r.u8()?;
        let protocol = Protocol::from_wire(protocol).ok_or(invalid("protocol", protocol))?;
        let role = role_from_wire(r.u8()?)?;
        let strategy = match r.u8()? {
            NO_STRATEGY => None,
            v => Some(Strategy::from_wire(v).ok_or(invalid("strategy", v))?),
        };
        let relay = read_optional(&mut r)?;
        let address = NetworkAddress::read_from(&mut r)?;
        let peer = NetworkAddress::read_from(&mut r)?;
        let state = r.u8()?;
        let state = TransportState::from_wire(state).ok_or(invalid("state", state))?;
        let raw = r.bool()?;
        let connect_timeout = Duration::from_micros(r.u64()?);
        let read_pos = r.u32()? as usize;
        let buffered = r.bytes()?;
        if read_pos > buffered.len() {
            return Err(WireError::InvalidValue {
                field: "read cursor",
                value: read_pos as u64,
            }
            .into());
        }
        let remote = read_optional(&mut r)?;

        let mut sockets = Vec::new();
        for _ in 0..r.u8()? {
            let kind = SocketKind::from_wire(r.u8()?)?;
            sockets.push(SharedSocket {
                kind,
                token: ShareToken(r.bytes()?),
            });
        }
        let mut sessions = Vec::new();
        for _ in 0..r.u32()? {
            let peer = NetworkAddress::read_from(&mut r)?;
            let target_text = r.text()?;
            let target = target_text
                .parse::<SocketAddr>()
                .map_err(|_| invalid("session target", 0))?;
            let session = r.bytes()?;
            let mut backlog = Vec::new();
            for _ in 0..r.u32()? {
                backlog.push(r.bytes()?);
            }
            sessions.push(PeerSnapshot {
                peer,
                target,
                session,
                backlog,
            });
        }
        let mut events = Vec::new();
        for _ in 0..r.u32()? {
            events.push(read_event(&mut r)?);
        }
        r.finish()?;

        Ok(Self {
            protocol,
            role,
            strategy,
            relay,
            address,
            peer,
            state,
            buffered,
            read_pos,
            raw,
            connect_timeout,
            remote,
            sockets,
            sessions,
            events,
        })
    }
}

fn fits<T: TryFrom<usize>>(field: &'static str, len: usize) -> Result<T, HandoffError> {
    T::try_from(len).map_err(|_| HandoffError::TooLarge { field, len })
}

fn write_event(w: &mut Writer, event: &TransportEvent) {
    match event {
        TransportEvent::Accepted { peer } => {
            w.u8(0);
            peer.write_to(w);
        }
        TransportEvent::Message { from, payload } => {
            w.u8(1);
            from.write_to(w);
            w.bytes(payload);
        }
        TransportEvent::RawData { from, bytes } => {
            w.u8(2);
            from.write_to(w);
            w.bytes(bytes);
        }
        TransportEvent::Disconnected { peer, reason } => {
            w.u8(3);
            peer.write_to(w);
            match reason {
                DisconnectReason::Closed => w.u8(0),
                DisconnectReason::TimedOut => w.u8(1),
                DisconnectReason::Error(e) => w.u8(2).text(e),
            };
        }
    }
}

fn read_event(r: &mut Reader<'_>) -> Result<TransportEvent, WireError> {
    let kind = r.u8()?;
    let peer = NetworkAddress::read_from(r)?;
    Ok(match kind {
        0 => TransportEvent::Accepted { peer },
        1 => TransportEvent::Message {
            from: peer,
            payload: r.bytes()?,
        },
        2 => TransportEvent::RawData {
            from: peer,
            bytes: r.bytes()?,
        },
        3 => {
            let reason = match r.u8()? {
                0 => DisconnectReason::Closed,
                1 => DisconnectReason::TimedOut,
                2 => DisconnectReason::Error(r.text()?),
                v => return Err(invalid("disconnect reason", v)),
            };
            TransportEvent::Disconnected { peer, reason }
        }
        v => return Err(invalid("event kind", v)),
    })
}

fn tcp_listener(fd: OwnedFd) -> Result<tokio::net::TcpListener, HandoffError> {
    let listener = std::net::TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(tokio::net::TcpListener::from_std(listener)?)
}

fn invalid(field: &'static str, value: u8) -> WireError {
    WireError::InvalidValue {
        field,
        value: u64::from(value),
    }
}

fn role_to_wire(role: Role) -> u8 {
    match role {
        Role::Server => 0,
        Role::Client => 1,
    }
}

fn role_from_wire(v: u8) -> Result<Role, WireError> {
    match v {
        0 => Ok(Role::Server),
        1 => Ok(Role::Client),
        _ => Err(invalid("role", v)),
    }
}

fn write_optional(w: &mut Writer, addr: Option<&NetworkAddress>) {
    w.bool(addr.is_some());
    if let Some(addr) = addr {
        addr.write_to(w);
    }
}

fn read_optional(r: &mut Reader<'_>) -> Result<Option<NetworkAddress>, WireError> {
    if r.bool()? {
        Ok(Some(NetworkAddress::read_from(r)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    use crate::address::FamilyPreference;
    use crate::frame::Frame;
    use crate::session::SessionConfig;

    fn sample() -> SessionHandoff {
        let mut session = ReliableSession::new(SessionConfig::default());
        session.submit(b"pending").unwrap();
        SessionHandoff {
            protocol: Protocol::Smart,
            role: Role::Client,
            strategy: Some(Strategy::Relay),
            relay: Some("10.0.0.1:3939".parse().unwrap()),
            address: "[::1]:7000".parse().unwrap(),
            peer: "[::1]:7000".parse().unwrap(),
            state: TransportState::Connected,
            buffered: vec![1, 2, 3, 4],
            read_pos: 1,
            raw: true,
            connect_timeout: Duration::from_millis(2500),
            remote: None,
            sockets: vec![SharedSocket {
                kind: SocketKind::TcpStream,
                token: ShareToken::new(vec![0, 0, 0, 9]),
            }],
            sessions: vec![PeerSnapshot {
                peer: "127.0.0.1:9".parse().unwrap(),
                target: "127.0.0.1:9".parse().unwrap(),
                session: session.serialize(),
                backlog: vec![b"later".to_vec()],
            }],
            events: vec![
                TransportEvent::Message {
                    from: "127.0.0.1:9".parse().unwrap(),
                    payload: b"queued".to_vec(),
                },
                TransportEvent::Disconnected {
                    peer: "127.0.0.1:10".parse().unwrap(),
                    reason: DisconnectReason::Error("reset".into()),
                },
            ],
        }
    }

    #[test]
    fn envelope_round_trip() {
        let h = sample();
        assert_eq!(SessionHandoff::decode(&h.encode().unwrap()).unwrap(), h);
    }

    #[test]
    fn envelope_rejects_foreign_bytes() {
        assert!(matches!(
            SessionHandoff::decode(b"JUNK\x01"),
            Err(HandoffError::BadMagic)
        ));
        let mut bytes = sample().encode().unwrap();
        bytes[4] = 99;
        assert!(matches!(
            SessionHandoff::decode(&bytes),
            Err(HandoffError::UnsupportedVersion(99))
        ));
        let bytes = sample().encode().unwrap();
        assert!(SessionHandoff::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn oversized_socket_list_is_refused() {
        let mut h = sample();
        h.sockets = vec![h.sockets[0].clone(); 256];
        assert!(matches!(
            h.encode(),
            Err(HandoffError::TooLarge {
                field: "socket count",
                len: 256
            })
        ));
    }

    #[test]
    fn bad_token_is_rejected() {
        assert!(matches!(
            FdBroker.redeem(&ShareToken::new(vec![1, 2])),
            Err(HandoffError::BadToken)
        ));
    }

    #[tokio::test]
    async fn disconnected_transport_cannot_be_handed_off() {
        let config = TransportConfig::default().with_preference(FamilyPreference::Ipv4Only);
        let mut t = Transport::listen(Protocol::Datagram, "127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        t.disconnect().await;
        assert!(matches!(
            SessionHandoff::produce(&t, &FdBroker),
            Err(HandoffError::InvalidState {
                state: TransportState::Disconnected
            })
        ));
    }

    #[tokio::test]
    async fn listener_survives_handoff() {
        let config = TransportConfig::default().with_preference(FamilyPreference::Ipv4Only);
        let t = Transport::listen(Protocol::Stream, "127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let port = t.address().port();
        let handoff = SessionHandoff::produce(&t, &FdBroker).unwrap();
        drop(t);

        let mut resumed = handoff.resume(&FdBroker, config).unwrap();
        assert_eq!(resumed.state(), TransportState::Listening);
        assert_eq!(resumed.local_addr().map(|a| a.port()), Some(port));

        let client = tokio::net::TcpStream::connect(("127.0.0.1", port));
        let (conn, accepted) = tokio::join!(client, resumed.accept());
        assert!(conn.is_ok());
        assert_eq!(accepted.unwrap().state(), TransportState::Connected);
    }

    #[tokio::test]
    async fn accepted_connection_survives_handoff() {
        let config = TransportConfig::default().with_preference(FamilyPreference::Ipv4Only);
        let mut t =
            Transport::listen(Protocol::Stream, "127.0.0.1:0".parse().unwrap(), config.clone())
                .await
                .unwrap();
        let port = t.address().port();
        let (conn, accepted) = tokio::join!(
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
            t.next_event()
        );
        let mut conn = conn.unwrap();
        assert!(matches!(accepted, Some(TransportEvent::Accepted { .. })));
        assert_eq!(t.pending_accepts(), 1);

        let handoff = SessionHandoff::produce(&t, &FdBroker).unwrap();
        drop(t);
        let mut resumed = handoff.resume(&FdBroker, config).unwrap();
        assert_eq!(resumed.pending_accepts(), 1);

        let mut server_side = resumed.accept().await.unwrap();
        conn.write_all(&Frame::Data(b"hi".to_vec()).encode())
            .await
            .unwrap();
        match server_side.next_event().await {
            Some(TransportEvent::Message { payload, .. }) => assert_eq!(payload, b"hi"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
