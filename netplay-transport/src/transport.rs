//! The transport abstraction: one enum over the stream, datagram and smart
//! variants, plus the event, configuration and error types they share.
//!
//! ```text
//!                      Transport
//!          ┌───────────────┼────────────────┐
//!          ▼               ▼                ▼
//!   StreamTransport  DatagramTransport  SmartTransport
//!    (TCP + frames)   (UDP + sessions)   (picks one of the others,
//!                                         or a relayed stream)
//! ```
//!
//! Callers drive a transport by awaiting [`Transport::next_event`] in a loop.
//! Every variant's `next_event` only suspends on a socket read, a listener
//! accept or a timer tick, so it is safe to race against other futures in
//! `tokio::select!`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::address::{FamilyPreference, NetworkAddress, ResolutionError};
use crate::datagram::DatagramTransport;
use crate::session::SessionConfig;
use crate::simulator::FaultConfig;
use crate::smart::SmartTransport;
use crate::state::TransportState;
use crate::stream::StreamTransport;

// ---------------------------------------------------------------------------
// Protocol + role
// ---------------------------------------------------------------------------

/// Which transport variant; fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Stream,
    Datagram,
    Smart,
}

impl Protocol {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Stream => 0,
            Self::Datagram => 1,
            Self::Smart => 2,
        }
    }

    pub(crate) fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Stream,
            1 => Self::Datagram,
            2 => Self::Smart,
            _ => return None,
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stream => "stream",
            Self::Datagram => "datagram",
            Self::Smart => "smart",
        })
    }
}

/// Which side of a connection a transport plays.
///
/// A listener bound to the any address has an empty host; one bound to a
/// specific interface does not, so the role is recorded explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Why a peer went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection.
    Closed,
    /// The peer stopped acknowledging retransmissions.
    TimedOut,
    /// The socket failed.
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed by peer"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Error(e) => write!(f, "socket error: {e}"),
        }
    }
}

/// What [`Transport::next_event`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A new peer reached a listening transport.
    Accepted { peer: NetworkAddress },
    /// A complete application message (framed mode).
    Message {
        from: NetworkAddress,
        payload: Vec<u8>,
    },
    /// Unread bytes are waiting (raw mode).  `bytes` is everything past the
    /// read cursor; call [`Transport::consume`] for what was used.
    RawData { from: NetworkAddress, bytes: Vec<u8> },
    /// A peer is gone.  When it was the transport's only peer the transport
    /// itself is now [`TransportState::Disconnected`].
    Disconnected {
        peer: NetworkAddress,
        reason: DisconnectReason,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings shared by every transport variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Captured from [`FamilyPreference::current`] when the config is built.
    pub preference: FamilyPreference,
    /// Deliver raw bytes instead of framed messages.
    pub raw: bool,
    /// Cadence of the retransmission tick for datagram sessions.
    pub tick_interval: Duration,
    pub faults: FaultConfig,
    pub session: SessionConfig,
    /// Messages a datagram peer may queue behind a full window before
    /// `send` refuses more.
    pub max_backlog: usize,
    /// Relay hosts for the smart transport's last-resort path.
    pub relays: Vec<NetworkAddress>,
    /// Skip the direct attempts of the smart transport.
    pub force_relay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            preference: FamilyPreference::current(),
            raw: false,
            tick_interval: Duration::from_millis(20),
            faults: FaultConfig::default(),
            session: SessionConfig::default(),
            max_backlog: 1024,
            relays: Vec::new(),
            force_relay: false,
        }
    }
}

impl TransportConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_preference(mut self, preference: FamilyPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_max_backlog(mut self, n: usize) -> Self {
        self.max_backlog = n;
        self
    }

    pub fn with_relays(mut self, relays: Vec<NetworkAddress>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_force_relay(mut self, force: bool) -> Self {
        self.force_relay = force;
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures returned synchronously by transport operations.
///
/// Failures after a connection is established are reported as
/// [`TransportEvent::Disconnected`] instead.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("cannot bind {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("cannot connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("no response from {address} within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("{address} failed the handshake: {reason}")]
    Handshake { address: String, reason: String },
    #[error("no path to {address} after {attempts} attempt(s); last error: {last}")]
    Unreachable {
        address: String,
        attempts: usize,
        last: String,
    },
    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: TransportState,
    },
    #[error("no accepted connection is waiting on {address}")]
    NothingToAccept { address: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolve `address` under `preference` without touching the caller's cache.
pub(crate) async fn resolve_candidates(
    address: &NetworkAddress,
    preference: FamilyPreference,
) -> Result<Vec<SocketAddr>, ResolutionError> {
    let mut address = address.clone();
    Ok(address.resolve_async(preference).await?.to_vec())
}

/// Apply a lifecycle transition, refusing the ones the state machine forbids.
pub(crate) fn advance(state: &mut TransportState, next: TransportState) -> bool {
    if *state == next {
        return true;
    }
    if !state.can_transition_to(next) {
        log::warn!("[transport] refusing transition {state} -> {next}");
        return false;
    }
    log::debug!("[transport] {state} -> {next}");
    *state = next;
    true
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A stream, datagram or smart transport.
#[derive(Debug)]
pub enum Transport {
    Stream(StreamTransport),
    Datagram(DatagramTransport),
    Smart(SmartTransport),
}

impl Transport {
    /// Open a client transport to `remote`.
    ///
    /// Fails with [`TransportError::Timeout`] when no path answers within
    /// `config.connect_timeout`.  Dropping the future cancels the attempt.
    pub async fn connect(
        protocol: Protocol,
        remote: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        Ok(match protocol {
            Protocol::Stream => Self::Stream(StreamTransport::connect(remote, config).await?),
            Protocol::Datagram => {
                Self::Datagram(DatagramTransport::connect(remote, config).await?)
            }
            Protocol::Smart => Self::Smart(SmartTransport::connect(remote, config).await?),
        })
    }

    /// Open a listening transport on `local` (empty host = any address).
    pub async fn listen(
        protocol: Protocol,
        local: NetworkAddress,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        Ok(match protocol {
            Protocol::Stream => Self::Stream(StreamTransport::listen(local, config).await?),
            Protocol::Datagram => Self::Datagram(DatagramTransport::listen(local, config).await?),
            Protocol::Smart => Self::Smart(SmartTransport::listen(local, config).await?),
        })
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Stream(_) => Protocol::Stream,
            Self::Datagram(_) => Protocol::Datagram,
            Self::Smart(_) => Protocol::Smart,
        }
    }

    /// Local bind address for a server, remote address for a client.
    pub fn address(&self) -> &NetworkAddress {
        match self {
            Self::Stream(t) => t.address(),
            Self::Datagram(t) => t.address(),
            Self::Smart(t) => t.address(),
        }
    }

    pub fn state(&self) -> TransportState {
        match self {
            Self::Stream(t) => t.state(),
            Self::Datagram(t) => t.state(),
            Self::Smart(t) => t.state(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Stream(t) => t.role(),
            Self::Datagram(t) => t.role(),
            Self::Smart(t) => t.role(),
        }
    }

    pub fn is_server(&self) -> bool {
        self.role() == Role::Server
    }

    pub fn is_raw(&self) -> bool {
        match self {
            Self::Stream(t) => t.is_raw(),
            Self::Datagram(t) => t.is_raw(),
            Self::Smart(t) => t.is_raw(),
        }
    }

    /// OS-assigned local socket address, while a socket is held.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Stream(t) => t.local_addr(),
            Self::Datagram(t) => t.local_addr(),
            Self::Smart(t) => t.local_addr(),
        }
    }

    /// Queue `bytes` for delivery.
    ///
    /// Stream transports ignore `peer`.  Datagram and smart transports use it
    /// to pick (or create) the peer's session; a client may pass `None` for
    /// its remote.  Returns `false` once the transport is no longer usable.
    pub async fn send(&mut self, bytes: &[u8], peer: Option<&NetworkAddress>) -> bool {
        match self {
            Self::Stream(t) => t.send(bytes).await,
            Self::Datagram(t) => t.send(bytes, peer).await,
            Self::Smart(t) => t.send(bytes, peer).await,
        }
    }

    /// Take the next connection from a listening transport.
    ///
    /// - A stream listener returns the oldest connection reported through
    ///   [`TransportEvent::Accepted`], or waits for a new one.
    /// - A smart listener only returns TCP peers already reported through
    ///   `Accepted` (see [`pending_accepts`](Self::pending_accepts)).  Its
    ///   datagram peers are served in place, so with nothing pending it
    ///   fails at once with [`TransportError::NothingToAccept`].
    /// - A datagram transport never has connections to hand out: its peers
    ///   are served in place, and `accept` is always
    ///   [`TransportError::InvalidState`].
    pub async fn accept(&mut self) -> Result<Transport, TransportError> {
        match self {
            Self::Stream(t) => Ok(Self::Stream(t.accept().await?)),
            Self::Datagram(t) => Err(TransportError::InvalidState {
                operation: "accept on a datagram transport",
                state: t.state(),
            }),
            Self::Smart(t) => Ok(Self::Smart(t.accept().await?)),
        }
    }

    /// Connections `accept` can return without waiting.
    pub fn pending_accepts(&self) -> usize {
        match self {
            Self::Stream(t) => t.pending_accepts(),
            Self::Datagram(_) => 0,
            Self::Smart(t) => t.pending_accepts(),
        }
    }

    /// Wait for the next event; `None` once the transport is disconnected
    /// and every pending event has been returned.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        match self {
            Self::Stream(t) => t.next_event().await,
            Self::Datagram(t) => t.next_event().await,
            Self::Smart(t) => t.next_event().await,
        }
    }

    /// Unread bytes (raw mode).
    pub fn buffered(&self) -> &[u8] {
        match self {
            Self::Stream(t) => t.buffered(),
            Self::Datagram(t) => t.buffered(),
            Self::Smart(t) => t.buffered(),
        }
    }

    /// Advance the raw read cursor; returns how many bytes were consumed.
    pub fn consume(&mut self, n: usize) -> usize {
        match self {
            Self::Stream(t) => t.consume(n),
            Self::Datagram(t) => t.consume(n),
            Self::Smart(t) => t.consume(n),
        }
    }

    /// Release the socket, clear buffers and sessions.  Idempotent.
    pub async fn disconnect(&mut self) {
        match self {
            Self::Stream(t) => t.disconnect().await,
            Self::Datagram(t) => t.disconnect(),
            Self::Smart(t) => t.disconnect().await,
        }
    }
}

impl From<StreamTransport> for Transport {
    fn from(t: StreamTransport) -> Self {
        Self::Stream(t)
    }
}

impl From<DatagramTransport> for Transport {
    fn from(t: DatagramTransport) -> Self {
        Self::Datagram(t)
    }
}

impl From<SmartTransport> for Transport {
    fn from(t: SmartTransport) -> Self {
        Self::Smart(t)
    }
}
