//! Datagram transport: many reliable sessions multiplexed over one UDP socket.
//!
//! # Architecture
//!
//! ```text
//!   send(bytes, peer) ──▶ PeerLink ──▶ ReliableSession ──┐
//!                          (backlog)                     │ datagrams
//!                                                        ▼
//!   next_event() ◀── handle_io ◀── wait_io ◀──── DatagramSocket
//!                                    ▲
//!                                    └── tick interval ──▶ retransmits
//! ```
//!
//! A listening transport serves every peer in place: a SYN from an unknown
//! address creates its [`PeerLink`] and is answered with SYN|ACK, and the
//! peer is reported through [`TransportEvent::Accepted`].  A client performs
//! the same handshake towards one remote before it reports `Connected`.
//! FIN evicts the sender's session on the far side.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::address::NetworkAddress;
use crate::frame::ReadBuffer;
use crate::packet::Packet;
use crate::session::{ReliableSession, SessionConfig, SessionError};
use crate::simulator::FaultInjector;
use crate::socket::DatagramSocket;
use crate::state::TransportState;
use crate::transport::{
    advance, resolve_candidates, DisconnectReason, Role, TransportConfig, TransportError,
    TransportEvent,
};

// ---------------------------------------------------------------------------
// PeerLink
// ---------------------------------------------------------------------------

/// Everything the transport keeps for one remote peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerLink {
    pub(crate) session: ReliableSession,
    /// Where this peer's datagrams are sent.
    pub(crate) target: SocketAddr,
    /// Messages waiting for room in the send window.
    pub(crate) backlog: VecDeque<Vec<u8>>,
}

impl PeerLink {
    pub(crate) fn new(target: SocketAddr, config: SessionConfig) -> Self {
        Self {
            session: ReliableSession::new(config),
            target,
            backlog: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, bytes: &[u8], limit: usize) -> bool {
        if self.backlog.len() >= limit {
            log::warn!(
                "[udp] backlog for {} is full ({limit} message(s)); refusing send",
                self.target
            );
            return false;
        }
        self.backlog.push_back(bytes.to_vec());
        true
    }

    /// Move backlogged messages into the window while it has room.
    fn drain_backlog(&mut self, socket: &mut DatagramSocket) {
        while self.session.can_send() {
            let Some(msg) = self.backlog.pop_front() else {
                break;
            };
            match self.session.submit(&msg) {
                Ok(sub) => transmit(socket, &sub.datagram, self.target),
                Err(e) => log::warn!("[udp] dropping backlogged message for {}: {e}", self.target),
            }
        }
    }
}

/// Send one datagram, logging instead of failing: the session retransmits.
fn transmit(socket: &mut DatagramSocket, datagram: &[u8], dest: SocketAddr) {
    if let Err(e) = socket.send_bytes(datagram, dest) {
        log::debug!("[udp] send to {dest} failed: {e}");
    }
}

/// Adapt `target` to the family of the local socket.
///
/// An IPv6 socket reaches IPv4 peers through mapped addresses.
fn route(local: &SocketAddr, target: SocketAddr) -> Option<SocketAddr> {
    match (local.ip(), target.ip()) {
        (IpAddr::V6(_), IpAddr::V4(v4)) => Some(SocketAddr::new(
            IpAddr::V6(v4.to_ipv6_mapped()),
            target.port(),
        )),
        (IpAddr::V4(_), IpAddr::V6(v6)) => v6
            .to_ipv4_mapped()
            .map(|v4| SocketAddr::new(IpAddr::V4(v4), target.port())),
        _ => Some(target),
    }
}

/// Unspecified local address of the same family as `target`.
fn bind_any_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Result of one wait on the socket or the tick interval.
#[derive(Debug)]
pub(crate) enum Io {
    Datagram(Vec<u8>, SocketAddr),
    Tick,
    Failed(io::Error),
}

// ---------------------------------------------------------------------------
// DatagramTransport
// ---------------------------------------------------------------------------

/// UDP transport with one [`ReliableSession`] per peer.
#[derive(Debug)]
pub struct DatagramTransport {
    pub(crate) role: Role,
    pub(crate) address: NetworkAddress,
    pub(crate) state: TransportState,
    pub(crate) socket: Option<DatagramSocket>,
    pub(crate) peers: HashMap<NetworkAddress, PeerLink>,
    /// Session key of a client's remote.
    pub(crate) remote: Option<NetworkAddress>,
    pub(crate) buffer: ReadBuffer,
    /// Origin of the bytes in `buffer` (raw mode).
    pub(crate) raw_from: Option<NetworkAddress>,
    pub(crate) raw_ready: bool,
    pub(crate) config: TransportConfig,
    pub(crate) events: VecDeque<TransportEvent>,
    ticker: Interval,
    last_tick: Instant,
}

impl DatagramTransport {
    pub(crate) fn with_socket(
        role: Role,
        address: NetworkAddress,
        state: TransportState,
        socket: DatagramSocket,
        config: TransportConfig,
    ) -> Self {
        let mut ticker = tokio::time::interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            role,
            address,
            state,
            socket: Some(socket),
            peers: HashMap::new(),
            remote: None,
            buffer: ReadBuffer::new(),
            raw_from: None,
            raw_ready: false,
            config,
            events: VecDeque::new(),
            ticker,
            last_tick: Instant::now(),
        }
    }

    /// Bind a listening transport on `local`.
    pub async fn listen(
        mut local: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let candidates = resolve_candidates(&local, config.preference).await?;
        let mut last_err = None;
        for addr in candidates {
            match DatagramSocket::bind(addr, FaultInjector::new(config.faults)).await {
                Ok(socket) => {
                    local.set_port(socket.local_addr.port());
                    log::info!("[udp] listening on {}", socket.local_addr);
                    return Ok(Self::with_socket(
                        Role::Server,
                        local,
                        TransportState::Listening,
                        socket,
                        config,
                    ));
                }
                Err(e) => {
                    log::debug!("[udp] bind {addr} failed: {e}");
                    last_err = Some((addr, e));
                }
            }
        }
        Err(match last_err {
            Some((addr, source)) => TransportError::Bind {
                address: addr.to_string(),
                source,
            },
            None => TransportError::Unreachable {
                address: local.to_string(),
                attempts: 0,
                last: "no local address".into(),
            },
        })
    }

    /// Handshake with `remote`, trying each resolved record in turn.
    pub async fn connect(
        remote: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let candidates = resolve_candidates(&remote, config.preference).await?;
        let mut last_err = None;
        for target in candidates {
            match Self::connect_to(remote.clone(), target, config.clone()).await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    log::debug!("[udp] {target}: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::Unreachable {
            address: remote.to_string(),
            attempts: 0,
            last: "no address records".into(),
        }))
    }

    /// Handshake with one concrete `target`.
    pub(crate) async fn connect_to(
        remote: NetworkAddress,
        target: SocketAddr,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let bind = bind_any_for(&target);
        let mut socket = DatagramSocket::bind(bind, FaultInjector::new(config.faults))
            .await
            .map_err(|source| TransportError::Bind {
                address: bind.to_string(),
                source,
            })?;
        let mut state = TransportState::Connecting;
        log::debug!("[udp] {state} to {target} from {}", socket.local_addr);

        handshake(&mut socket, target, &config).await?;
        advance(&mut state, TransportState::Connected);

        let key = NetworkAddress::from(target);
        let mut t = Self::with_socket(Role::Client, remote, state, socket, config);
        t.peers
            .insert(key.clone(), PeerLink::new(target, t.config.session));
        t.remote = Some(key);
        log::info!("[udp] connected to {target}");
        Ok(t)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_raw(&self) -> bool {
        self.config.raw
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|s| s.local_addr)
    }

    /// Session keys of every known peer.
    pub fn peers(&self) -> impl Iterator<Item = &NetworkAddress> {
        self.peers.keys()
    }

    pub fn session(&self, peer: &NetworkAddress) -> Option<&ReliableSession> {
        self.peers.get(peer).map(|l| &l.session)
    }

    /// Messages waiting for window space towards `peer`.
    pub fn backlog_len(&self, peer: &NetworkAddress) -> usize {
        self.peers.get(peer).map_or(0, |l| l.backlog.len())
    }

    pub fn buffered(&self) -> &[u8] {
        self.buffer.unread()
    }

    pub fn consume(&mut self, n: usize) -> usize {
        self.buffer.consume(n)
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Resolve `peer` to a session key and a target socket address.
    async fn peer_route(
        &self,
        peer: Option<&NetworkAddress>,
    ) -> Option<(NetworkAddress, SocketAddr)> {
        let known = |key: &NetworkAddress| self.peers.get(key).map(|l| (key.clone(), l.target));
        match peer {
            None => match &self.remote {
                Some(remote) => known(remote),
                None => {
                    log::warn!("[udp] a listening transport needs a peer address to send");
                    None
                }
            },
            Some(p) if *p == self.address && self.role == Role::Client => {
                self.remote.as_ref().and_then(known)
            }
            Some(p) => {
                if let Some(hit) = known(p) {
                    return Some(hit);
                }
                let local = self.socket.as_ref()?.local_addr;
                let target = resolve_candidates(p, self.config.preference)
                    .await
                    .map_err(|e| log::warn!("[udp] {e}"))
                    .ok()?
                    .into_iter()
                    .find_map(|t| route(&local, t))?;
                let key = NetworkAddress::from(target);
                Some(known(&key).unwrap_or((key, target)))
            }
        }
    }

    /// Submit `bytes` to the peer's session, backlogging on a full window.
    ///
    /// Returns `false` when the peer's backlog already holds
    /// [`TransportConfig::max_backlog`] messages; nothing is queued then.
    pub async fn send(&mut self, bytes: &[u8], peer: Option<&NetworkAddress>) -> bool {
        if self.state == TransportState::Disconnected {
            return false;
        }
        let Some((key, target)) = self.peer_route(peer).await else {
            return false;
        };
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        let session_config = self.config.session;
        let max_backlog = self.config.max_backlog;
        let link = self
            .peers
            .entry(key)
            .or_insert_with(|| PeerLink::new(target, session_config));

        if !link.backlog.is_empty() {
            return link.enqueue(bytes, max_backlog);
        }
        match link.session.submit(bytes) {
            Ok(sub) => transmit(socket, &sub.datagram, link.target),
            Err(SessionError::WindowFull { .. }) => {
                log::trace!("[udp] window full for {}; backlogging", link.target);
                return link.enqueue(bytes, max_backlog);
            }
            Err(e) => {
                log::warn!("[udp] cannot send to {}: {e}", link.target);
                return false;
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Wait for the next event; `None` once disconnected and drained.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(ev) = self.pop_event() {
                return Some(ev);
            }
            if self.state == TransportState::Disconnected {
                return None;
            }
            let io = self.wait_io().await;
            self.handle_io(io);
        }
    }

    pub(crate) fn pop_event(&mut self) -> Option<TransportEvent> {
        if let Some(ev) = self.events.pop_front() {
            return Some(ev);
        }
        if self.raw_ready {
            self.raw_ready = false;
            if !self.buffer.is_empty() {
                return Some(TransportEvent::RawData {
                    from: self.raw_from.clone().unwrap_or_default(),
                    bytes: self.buffer.unread().to_vec(),
                });
            }
        }
        None
    }

    /// Suspend until a datagram arrives or the tick fires.  Cancel-safe.
    pub(crate) async fn wait_io(&mut self) -> Io {
        let Some(socket) = self.socket.as_ref() else {
            return std::future::pending().await;
        };
        tokio::select! {
            r = socket.recv_from() => match r {
                Ok((bytes, from)) => Io::Datagram(bytes, from),
                Err(e) => Io::Failed(e),
            },
            _ = self.ticker.tick() => Io::Tick,
        }
    }

    pub(crate) fn handle_io(&mut self, io: Io) {
        match io {
            Io::Datagram(bytes, from) => self.on_datagram(&bytes, from),
            Io::Tick => self.on_tick(),
            Io::Failed(e) => match e.kind() {
                // ICMP errors surfaced on the next receive; the peer's session
                // times out on its own.
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => {
                    log::debug!("[udp] {e}");
                }
                _ => {
                    log::warn!("[udp] receive failed: {e}");
                    let peer = self.remote.clone().unwrap_or_else(|| self.address.clone());
                    self.events.push_back(TransportEvent::Disconnected {
                        peer,
                        reason: DisconnectReason::Error(e.to_string()),
                    });
                    self.close_local();
                }
            },
        }
    }

    fn on_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        let packet = match socket.decode_inbound(bytes) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[udp] discarding datagram from {from}: {e}");
                return;
            }
        };
        let key = NetworkAddress::from(from);

        if packet.is_syn() {
            if let Err(e) = socket.send_packet(&Packet::syn_ack(), from) {
                log::debug!("[udp] SYN|ACK to {from} failed: {e}");
            }
            if self.state == TransportState::Listening && !self.peers.contains_key(&key) {
                log::info!("[udp] accepted {from}");
                self.peers
                    .insert(key.clone(), PeerLink::new(from, self.config.session));
                self.events.push_back(TransportEvent::Accepted { peer: key });
            }
            return;
        }
        if packet.is_syn_ack() {
            return;
        }
        if packet.is_fin() {
            if self.peers.remove(&key).is_some() {
                log::info!("[udp] {from} closed");
                self.events.push_back(TransportEvent::Disconnected {
                    peer: key.clone(),
                    reason: DisconnectReason::Closed,
                });
                if self.remote.as_ref() == Some(&key) {
                    self.close_local();
                }
            }
            return;
        }

        if !self.peers.contains_key(&key) {
            if self.state != TransportState::Listening {
                log::debug!("[udp] ignoring datagram from unknown peer {from}");
                return;
            }
            log::info!("[udp] accepted {from} (no handshake)");
            self.peers
                .insert(key.clone(), PeerLink::new(from, self.config.session));
            self.events
                .push_back(TransportEvent::Accepted { peer: key.clone() });
        }
        let Some(link) = self.peers.get_mut(&key) else {
            return;
        };

        let incoming = link.session.on_packet(&packet);
        if let Some(reply) = &incoming.reply {
            transmit(socket, reply, link.target);
        }
        if incoming.acked > 0 {
            link.drain_backlog(socket);
        }
        for payload in incoming.delivered {
            if self.config.raw {
                self.buffer.extend(&payload);
                self.raw_from = Some(key.clone());
                self.raw_ready = true;
            } else {
                self.events.push_back(TransportEvent::Message {
                    from: key.clone(),
                    payload,
                });
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        let mut stalled = Vec::new();
        for (key, link) in self.peers.iter_mut() {
            for datagram in link.session.tick(elapsed) {
                transmit(socket, &datagram, link.target);
            }
            if link.session.is_stalled() {
                stalled.push(key.clone());
            }
        }
        for key in stalled {
            log::warn!("[udp] {key} stopped acknowledging; evicting");
            self.peers.remove(&key);
            self.events.push_back(TransportEvent::Disconnected {
                peer: key.clone(),
                reason: DisconnectReason::TimedOut,
            });
            if self.remote.as_ref() == Some(&key) {
                self.close_local();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Drop one peer's session and tell it with a FIN.
    pub fn evict(&mut self, peer: &NetworkAddress) -> bool {
        let Some(link) = self.peers.remove(peer) else {
            return false;
        };
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = socket.send_packet(&Packet::fin(), link.target) {
                log::debug!("[udp] FIN to {} failed: {e}", link.target);
            }
        }
        log::info!("[udp] evicted {peer}");
        if self.remote.as_ref() == Some(peer) {
            self.close_local();
        }
        true
    }

    fn close_local(&mut self) {
        self.socket = None;
        self.peers.clear();
        self.buffer.clear();
        self.raw_ready = false;
        advance(&mut self.state, TransportState::Disconnected);
    }

    /// Send FIN to every peer, release the socket and clear all state.
    pub fn disconnect(&mut self) {
        if self.state == TransportState::Disconnected {
            return;
        }
        if let Some(socket) = self.socket.as_mut() {
            for link in self.peers.values() {
                if let Err(e) = socket.send_packet(&Packet::fin(), link.target) {
                    log::debug!("[udp] FIN to {} failed: {e}", link.target);
                }
            }
        }
        self.events.clear();
        self.close_local();
        log::info!("[udp] disconnected {}", self.address);
    }
}

/// Client side of the SYN → SYN|ACK exchange.
///
/// The SYN is repeated every initial RTO until the reply arrives or
/// `config.connect_timeout` passes.
async fn handshake(
    socket: &mut DatagramSocket,
    target: SocketAddr,
    config: &TransportConfig,
) -> Result<(), TransportError> {
    let exchange = async {
        let mut resend = tokio::time::interval(config.session.timer.initial_rto);
        loop {
            tokio::select! {
                _ = resend.tick() => {
                    log::trace!("[udp] → SYN {target}");
                    if let Err(e) = socket.send_packet(&Packet::syn(), target) {
                        log::debug!("[udp] SYN to {target} failed: {e}");
                    }
                }
                r = socket.recv_from() => match r {
                    Ok((bytes, from)) if from == target => match socket.decode_inbound(&bytes) {
                        Ok(p) if p.is_syn_ack() => return,
                        Ok(_) => {}
                        Err(e) => log::debug!("[udp] handshake reply from {from}: {e}"),
                    },
                    Ok(_) => {}
                    Err(e) => log::debug!("[udp] handshake receive: {e}"),
                },
            }
        }
    };
    tokio::time::timeout(config.connect_timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout {
            address: target.to_string(),
            timeout: config.connect_timeout,
        })
}
