//! Smart transport: whichever path reaches the peer.
//!
//! A connecting smart transport walks the [`RelaySelector`] plan: a direct
//! datagram handshake, then a direct stream, then a tunnel through each
//! relay.  The first path that works becomes the delegate for every later
//! call.  Stream paths open with a [`Frame::Hello`] so the acceptor learns
//! whether the connection came through a relay.
//!
//! A listening smart transport holds a UDP socket and a TCP listener on the
//! same port.  Datagram peers are served in place like a
//! [`DatagramTransport`] listener; TCP peers are handed out by `accept`.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::address::NetworkAddress;
use crate::datagram::DatagramTransport;
use crate::frame::Frame;
use crate::selector::{RelaySelector, Strategy};
use crate::simulator::FaultInjector;
use crate::socket::DatagramSocket;
use crate::state::TransportState;
use crate::stream::StreamTransport;
use crate::transport::{resolve_candidates, Role, TransportConfig, TransportError, TransportEvent};

/// Listening half: UDP peers in place, TCP connections queued for `accept`.
#[derive(Debug)]
pub(crate) struct SmartListener {
    pub(crate) datagram: DatagramTransport,
    pub(crate) tcp: Option<TcpListener>,
    pub(crate) pending: VecDeque<(TcpStream, SocketAddr)>,
}

impl SmartListener {
    pub(crate) fn new(datagram: DatagramTransport, tcp: Option<TcpListener>) -> Self {
        Self {
            datagram,
            tcp,
            pending: VecDeque::new(),
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(ev) = self.datagram.pop_event() {
                return Some(ev);
            }
            if self.datagram.state() == TransportState::Disconnected {
                return None;
            }
            let Some(tcp) = self.tcp.as_ref() else {
                let io = self.datagram.wait_io().await;
                self.datagram.handle_io(io);
                continue;
            };
            tokio::select! {
                io = self.datagram.wait_io() => self.datagram.handle_io(io),
                r = tcp.accept() => match r {
                    Ok((stream, from)) => {
                        log::debug!("[smart] tcp connection from {from}");
                        self.pending.push_back((stream, from));
                        return Some(TransportEvent::Accepted {
                            peer: NetworkAddress::from(from),
                        });
                    }
                    Err(e) => log::warn!("[smart] accept failed: {e}"),
                },
            }
        }
    }
}

#[derive(Debug)]
pub(crate) enum SmartDelegate {
    Datagram(DatagramTransport),
    Stream(StreamTransport),
    Listener(SmartListener),
}

/// A transport that picks its path at connect time.
#[derive(Debug)]
pub struct SmartTransport {
    pub(crate) address: NetworkAddress,
    pub(crate) strategy: Option<Strategy>,
    /// Relay the tunnel runs through, for [`Strategy::Relay`].
    pub(crate) relay: Option<NetworkAddress>,
    pub(crate) delegate: SmartDelegate,
    pub(crate) config: TransportConfig,
}

impl SmartTransport {
    /// Try every planned path until one connects.
    pub async fn connect(
        remote: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let selector = RelaySelector::new(config.relays.clone(), config.preference)
            .with_force_relay(config.force_relay);
        let mut attempts = 0;
        let mut last = String::from("no usable path");

        for attempt in selector.plan(&remote) {
            for target in selector.resolve_targets(&attempt.via).await {
                attempts += 1;
                log::info!("[smart] trying {} via {target}", attempt.strategy);
                match Self::attempt(&remote, attempt.strategy, &attempt.via, target, &config).await
                {
                    Ok(t) => {
                        log::info!("[smart] connected to {remote} ({})", attempt.strategy);
                        return Ok(t);
                    }
                    Err(e) => {
                        log::info!("[smart] {} via {target} failed: {e}", attempt.strategy);
                        last = e.to_string();
                    }
                }
            }
        }
        Err(TransportError::Unreachable {
            address: remote.to_string(),
            attempts,
            last,
        })
    }

    async fn attempt(
        remote: &NetworkAddress,
        strategy: Strategy,
        via: &NetworkAddress,
        target: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let connected = |delegate, relay| Self {
            address: remote.clone(),
            strategy: Some(strategy),
            relay,
            delegate,
            config: config.clone(),
        };
        match strategy {
            Strategy::Datagram => {
                let t = DatagramTransport::connect_to(remote.clone(), target, config.clone()).await?;
                Ok(connected(SmartDelegate::Datagram(t), None))
            }
            Strategy::Stream => {
                let mut t =
                    StreamTransport::connect_to(remote.clone(), target, config.clone()).await?;
                t.write_frame(&Frame::Hello { relayed: false }).await?;
                Ok(connected(SmartDelegate::Stream(t), None))
            }
            Strategy::Relay => {
                let mut t = StreamTransport::connect_to(via.clone(), target, config.clone()).await?;
                t.write_frame(&Frame::RelayRequest {
                    destination: remote.clone(),
                })
                .await?;
                let reply = timeout(config.connect_timeout, t.read_frame())
                    .await
                    .map_err(|_| TransportError::Timeout {
                        address: target.to_string(),
                        timeout: config.connect_timeout,
                    })??;
                if reply != Frame::RelayAccept {
                    return Err(TransportError::Handshake {
                        address: target.to_string(),
                        reason: format!("expected relay accept, got {:?}", reply.kind()),
                    });
                }
                t.write_frame(&Frame::Hello { relayed: true }).await?;
                t.address = remote.clone();
                t.peer = remote.clone();
                t.rearm();
                Ok(connected(SmartDelegate::Stream(t), Some(via.clone())))
            }
        }
    }

    /// Bind TCP and UDP on the same local port.
    pub async fn listen(
        mut local: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut last_err = None;
        for addr in resolve_candidates(&local, config.preference).await? {
            let tcp = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(source) => {
                    last_err = Some(TransportError::Bind {
                        address: addr.to_string(),
                        source,
                    });
                    continue;
                }
            };
            let bound = tcp.local_addr()?;
            let udp = match DatagramSocket::bind(bound, FaultInjector::new(config.faults)).await {
                Ok(s) => s,
                Err(source) => {
                    log::debug!("[smart] udp bind {bound} failed: {source}");
                    last_err = Some(TransportError::Bind {
                        address: bound.to_string(),
                        source,
                    });
                    continue;
                }
            };
            local.set_port(bound.port());
            log::info!("[smart] listening on {bound} (tcp+udp)");
            let datagram = DatagramTransport::with_socket(
                Role::Server,
                local.clone(),
                TransportState::Listening,
                udp,
                config.clone(),
            );
            return Ok(Self {
                address: local,
                strategy: None,
                relay: None,
                delegate: SmartDelegate::Listener(SmartListener::new(datagram, Some(tcp))),
                config,
            });
        }
        Err(last_err.unwrap_or(TransportError::Unreachable {
            address: local.to_string(),
            attempts: 0,
            last: "no local address".into(),
        }))
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    /// Chosen path; `None` for a listener.
    pub fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    pub fn relay(&self) -> Option<&NetworkAddress> {
        self.relay.as_ref()
    }

    pub fn state(&self) -> TransportState {
        match &self.delegate {
            SmartDelegate::Datagram(t) => t.state(),
            SmartDelegate::Stream(t) => t.state(),
            SmartDelegate::Listener(l) => l.datagram.state(),
        }
    }

    pub fn role(&self) -> Role {
        match &self.delegate {
            SmartDelegate::Datagram(t) => t.role(),
            SmartDelegate::Stream(t) => t.role(),
            SmartDelegate::Listener(_) => Role::Server,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.config.raw
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.delegate {
            SmartDelegate::Datagram(t) => t.local_addr(),
            SmartDelegate::Stream(t) => t.local_addr(),
            SmartDelegate::Listener(l) => l.datagram.local_addr(),
        }
    }

    /// TCP peers reported as accepted and waiting for `accept`.
    pub fn pending_accepts(&self) -> usize {
        match &self.delegate {
            SmartDelegate::Listener(l) => l.pending.len(),
            _ => 0,
        }
    }

    pub fn buffered(&self) -> &[u8] {
        match &self.delegate {
            SmartDelegate::Datagram(t) => t.buffered(),
            SmartDelegate::Stream(t) => t.buffered(),
            SmartDelegate::Listener(l) => l.datagram.buffered(),
        }
    }

    pub fn consume(&mut self, n: usize) -> usize {
        match &mut self.delegate {
            SmartDelegate::Datagram(t) => t.consume(n),
            SmartDelegate::Stream(t) => t.consume(n),
            SmartDelegate::Listener(l) => l.datagram.consume(n),
        }
    }

    pub async fn send(&mut self, bytes: &[u8], peer: Option<&NetworkAddress>) -> bool {
        match &mut self.delegate {
            SmartDelegate::Datagram(t) => t.send(bytes, peer).await,
            SmartDelegate::Stream(t) => t.send(bytes).await,
            SmartDelegate::Listener(l) => l.datagram.send(bytes, peer).await,
        }
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        match &mut self.delegate {
            SmartDelegate::Datagram(t) => t.next_event().await,
            SmartDelegate::Stream(t) => t.next_event().await,
            SmartDelegate::Listener(l) => l.next_event().await,
        }
    }

    /// Take the next TCP peer reported by `next_event` and read its hello to
    /// learn its strategy.  Never waits for a new connection; datagram peers
    /// are served in place and never queue here.
    pub async fn accept(&mut self) -> Result<SmartTransport, TransportError> {
        let state = self.state();
        let SmartDelegate::Listener(l) = &mut self.delegate else {
            return Err(TransportError::InvalidState {
                operation: "accept",
                state,
            });
        };
        let Some((stream, from)) = l.pending.pop_front() else {
            return Err(TransportError::NothingToAccept {
                address: self.address.to_string(),
            });
        };

        let mut t = StreamTransport::from_stream(
            Role::Server,
            self.address.clone(),
            NetworkAddress::from(from),
            stream,
            self.config.clone(),
        );
        let hello = timeout(self.config.connect_timeout, t.read_frame())
            .await
            .map_err(|_| TransportError::Timeout {
                address: from.to_string(),
                timeout: self.config.connect_timeout,
            })??;
        let strategy = match hello {
            Frame::Hello { relayed: true } => Strategy::Relay,
            Frame::Hello { relayed: false } => Strategy::Stream,
            other => {
                return Err(TransportError::Handshake {
                    address: from.to_string(),
                    reason: format!("expected hello, got {:?}", other.kind()),
                })
            }
        };
        t.rearm();
        log::info!("[smart] accepted {from} ({strategy})");
        Ok(Self {
            address: self.address.clone(),
            strategy: Some(strategy),
            relay: None,
            delegate: SmartDelegate::Stream(t),
            config: self.config.clone(),
        })
    }

    pub async fn disconnect(&mut self) {
        match &mut self.delegate {
            SmartDelegate::Datagram(t) => t.disconnect(),
            SmartDelegate::Stream(t) => t.disconnect().await,
            SmartDelegate::Listener(l) => {
                l.datagram.disconnect();
                l.tcp = None;
                l.pending.clear();
            }
        }
    }
}
