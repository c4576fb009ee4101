//! Stream transport over TCP.
//!
//! In framed mode every message travels as one [`Frame::Data`]; control
//! frames interleaved by the smart transport or a relay are skipped.  In raw
//! mode bytes are written as given and the reader sees the unconsumed tail of
//! the receive buffer.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::address::NetworkAddress;
use crate::frame::{Frame, ReadBuffer, MAX_FRAME};
use crate::state::TransportState;
use crate::transport::{
    advance, resolve_candidates, DisconnectReason, Role, TransportConfig, TransportError,
    TransportEvent,
};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) enum StreamEndpoint {
    Listener(TcpListener),
    Connection(TcpStream),
    Closed,
}

/// A TCP listener or one TCP connection.
#[derive(Debug)]
pub struct StreamTransport {
    pub(crate) role: Role,
    pub(crate) address: NetworkAddress,
    /// The other end of a connection; equal to `address` for a client.
    pub(crate) peer: NetworkAddress,
    pub(crate) state: TransportState,
    pub(crate) endpoint: StreamEndpoint,
    pub(crate) buffer: ReadBuffer,
    /// Report the buffer on the next event even without a new read.
    pub(crate) raw_ready: bool,
    pub(crate) config: TransportConfig,
    pub(crate) events: VecDeque<TransportEvent>,
    /// Connections reported as `Accepted` but not yet taken by `accept`.
    pub(crate) pending: VecDeque<(TcpStream, SocketAddr)>,
}

impl StreamTransport {
    pub(crate) fn with_endpoint(
        role: Role,
        address: NetworkAddress,
        peer: NetworkAddress,
        state: TransportState,
        endpoint: StreamEndpoint,
        config: TransportConfig,
    ) -> Self {
        Self {
            role,
            address,
            peer,
            state,
            endpoint,
            buffer: ReadBuffer::new(),
            raw_ready: false,
            config,
            events: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    /// Wrap an established connection.
    pub(crate) fn from_stream(
        role: Role,
        address: NetworkAddress,
        peer: NetworkAddress,
        stream: TcpStream,
        config: TransportConfig,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[tcp] set_nodelay: {e}");
        }
        Self::with_endpoint(
            role,
            address,
            peer,
            TransportState::Connected,
            StreamEndpoint::Connection(stream),
            config,
        )
    }

    pub(crate) fn from_listener(
        address: NetworkAddress,
        listener: TcpListener,
        config: TransportConfig,
    ) -> Self {
        Self::with_endpoint(
            Role::Server,
            address.clone(),
            address,
            TransportState::Listening,
            StreamEndpoint::Listener(listener),
            config,
        )
    }

    pub async fn listen(
        mut local: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut last_err = None;
        for addr in resolve_candidates(&local, config.preference).await? {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?;
                    local.set_port(bound.port());
                    log::info!("[tcp] listening on {bound}");
                    return Ok(Self::from_listener(local, listener, config));
                }
                Err(source) => {
                    log::debug!("[tcp] bind {addr} failed: {source}");
                    last_err = Some(TransportError::Bind {
                        address: addr.to_string(),
                        source,
                    });
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::Unreachable {
            address: local.to_string(),
            attempts: 0,
            last: "no local address".into(),
        }))
    }

    /// Connect to `remote`, trying each resolved record in turn.
    pub async fn connect(
        remote: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut last_err = None;
        for target in resolve_candidates(&remote, config.preference).await? {
            match Self::connect_to(remote.clone(), target, config.clone()).await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    log::debug!("[tcp] {target}: {e}");
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

    pub(crate) async fn connect_to(
        remote: NetworkAddress,
        target: SocketAddr,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut state = TransportState::Connecting;
        log::debug!("[tcp] {state} to {target}");
        let stream = timeout(config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| TransportError::Timeout {
                address: target.to_string(),
                timeout: config.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                address: target.to_string(),
                source,
            })?;
        advance(&mut state, TransportState::Connected);
        log::info!("[tcp] connected to {target}");
        Ok(Self::from_stream(
            Role::Client,
            remote.clone(),
            remote,
            stream,
            config,
        ))
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.address
    }

    pub fn peer(&self) -> &NetworkAddress {
        &self.peer
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
        match &self.endpoint {
            StreamEndpoint::Listener(l) => l.local_addr().ok(),
            StreamEndpoint::Connection(s) => s.local_addr().ok(),
            StreamEndpoint::Closed => None,
        }
    }

    pub fn buffered(&self) -> &[u8] {
        self.buffer.unread()
    }

    pub fn consume(&mut self, n: usize) -> usize {
        self.buffer.consume(n)
    }

    /// Connections reported as accepted and waiting for [`accept`](Self::accept).
    pub fn pending_accepts(&self) -> usize {
        self.pending.len()
    }

    /// Flag leftover buffered bytes so raw readers see them without a read.
    pub(crate) fn rearm(&mut self) {
        self.raw_ready = self.config.raw && !self.buffer.is_empty();
    }

    /// Take the next connection from a listening transport.
    pub async fn accept(&mut self) -> Result<StreamTransport, TransportError> {
        if self.state != TransportState::Listening {
            return Err(TransportError::InvalidState {
                operation: "accept",
                state: self.state,
            });
        }
        let (stream, from) = match self.pending.pop_front() {
            Some(conn) => conn,
            None => match &self.endpoint {
                StreamEndpoint::Listener(listener) => listener.accept().await?,
                _ => {
                    return Err(TransportError::InvalidState {
                        operation: "accept",
                        state: self.state,
                    })
                }
            },
        };
        log::info!("[tcp] accepted {from}");
        Ok(Self::from_stream(
            Role::Server,
            self.address.clone(),
            NetworkAddress::from(from),
            stream,
            self.config.clone(),
        ))
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Write one message; `false` once the connection is unusable.
    pub async fn send(&mut self, bytes: &[u8]) -> bool {
        if self.config.raw {
            return self.write_bytes(bytes).await;
        }
        if bytes.len() > MAX_FRAME {
            log::warn!(
                "[tcp] message of {} bytes exceeds the {MAX_FRAME}-byte frame limit",
                bytes.len()
            );
            return false;
        }
        self.write_bytes(&Frame::Data(bytes.to_vec()).encode()).await
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        let StreamEndpoint::Connection(stream) = &mut self.endpoint else {
            return false;
        };
        match stream.write_all(bytes).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[tcp] write to {} failed: {e}", self.peer);
                self.fail(DisconnectReason::Error(e.to_string()));
                false
            }
        }
    }

    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match &mut self.endpoint {
            StreamEndpoint::Connection(stream) => Ok(stream.write_all(&frame.encode()).await?),
            _ => Err(TransportError::InvalidState {
                operation: "write",
                state: self.state,
            }),
        }
    }

    /// Read until one whole frame of any kind is buffered.
    pub(crate) async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                return Ok(frame);
            }
            let StreamEndpoint::Connection(stream) = &mut self.endpoint else {
                return Err(TransportError::InvalidState {
                    operation: "read",
                    state: self.state,
                });
            };
            let mut chunk = vec![0u8; READ_CHUNK];
            match stream.read(&mut chunk).await? {
                0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                n => self.buffer.extend(&chunk[..n]),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(ev) = self.pop_event() {
                return Some(ev);
            }
            match &mut self.endpoint {
                StreamEndpoint::Closed => return None,
                StreamEndpoint::Listener(listener) => match listener.accept().await {
                    Ok((stream, from)) => {
                        self.pending.push_back((stream, from));
                        return Some(TransportEvent::Accepted {
                            peer: NetworkAddress::from(from),
                        });
                    }
                    Err(e) => {
                        log::warn!("[tcp] accept failed: {e}");
                        tokio::task::yield_now().await;
                    }
                },
                StreamEndpoint::Connection(stream) => {
                    let mut chunk = vec![0u8; READ_CHUNK];
                    match stream.read(&mut chunk).await {
                        Ok(0) => {
                            log::info!("[tcp] {} closed the connection", self.peer);
                            self.fail(DisconnectReason::Closed);
                        }
                        Ok(n) => {
                            self.buffer.extend(&chunk[..n]);
                            self.raw_ready = self.config.raw;
                        }
                        Err(e) => {
                            log::warn!("[tcp] read from {} failed: {e}", self.peer);
                            self.fail(DisconnectReason::Error(e.to_string()));
                        }
                    }
                }
            }
        }
    }

    fn pop_event(&mut self) -> Option<TransportEvent> {
        if let Some(ev) = self.events.pop_front() {
            return Some(ev);
        }
        if self.config.raw {
            let ready = std::mem::take(&mut self.raw_ready);
            return (ready && !self.buffer.is_empty()).then(|| TransportEvent::RawData {
                from: self.peer.clone(),
                bytes: self.buffer.unread().to_vec(),
            });
        }
        while let Some(frame) = self.buffer.next_frame() {
            match frame {
                Frame::Data(payload) => {
                    return Some(TransportEvent::Message {
                        from: self.peer.clone(),
                        payload,
                    })
                }
                other => log::debug!("[tcp] ignoring {:?} frame from {}", other.kind(), self.peer),
            }
        }
        None
    }

    /// Close after a connection failure and queue the matching event.
    fn fail(&mut self, reason: DisconnectReason) {
        self.events.push_back(TransportEvent::Disconnected {
            peer: self.peer.clone(),
            reason,
        });
        self.close_local();
    }

    fn close_local(&mut self) {
        self.endpoint = StreamEndpoint::Closed;
        self.pending.clear();
        self.buffer.clear();
        self.raw_ready = false;
        advance(&mut self.state, TransportState::Disconnected);
    }

    /// Shut the connection down (or stop listening).  Idempotent.
    pub async fn disconnect(&mut self) {
        if let StreamEndpoint::Connection(stream) = &mut self.endpoint {
            if let Err(e) = stream.shutdown().await {
                log::debug!("[tcp] shutdown: {e}");
            }
        }
        if self.state != TransportState::Disconnected {
            log::info!("[tcp] disconnected {}", self.peer);
        }
        self.events.clear();
        self.close_local();
    }
}
