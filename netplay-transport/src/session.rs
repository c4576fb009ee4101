//! Per-peer reliable, ordered message session (Go-Back-N ARQ).
//!
//! # Architecture
//!
//! ```text
//!   submit(msg) ──▶ GbnSender ──── DATA seq=n ack=k ────▶ peer
//!                      ▲                                  │
//!                      │ on_ack                           │
//!   on_datagram ───────┴── ACK / piggy-backed ack ◀───────┘
//!        │
//!        └──▶ GbnReceiver ──▶ delivered messages (in order, once)
//!
//!   tick(elapsed) ──▶ RetransmitTimer ──▶ whole window resent on expiry
//! ```
//!
//! [`ReliableSession`] performs no I/O and reads no clock.  Callers feed it
//! inbound datagrams and elapsed time and transmit whatever datagrams it
//! hands back, which makes it straightforward to test, to multiplex many
//! sessions over one socket, and to snapshot for a process handoff.

use std::time::Duration;

use crate::gbn_receiver::{GbnReceiver, ReorderOverflow};
use crate::gbn_sender::GbnSender;
use crate::packet::{flags, Header, Packet, PacketError, MAX_PAYLOAD};
use crate::timer::{micros, RetransmitTimer, TimerConfig};
use crate::wire::{Reader, WireError, Writer};

/// Snapshot format version written by [`ReliableSession::serialize`].
const SNAPSHOT_VERSION: u8 = 2;

// ---------------------------------------------------------------------------
// Config + errors
// ---------------------------------------------------------------------------

/// Tunables for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum unacknowledged messages in flight (N).
    pub window_size: usize,
    /// Maximum out-of-order messages held for later delivery.
    pub reorder_capacity: usize,
    pub timer: TimerConfig,
    /// Consecutive retransmission timeouts before the peer counts as lost.
    pub max_timeouts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: 32,
            reorder_capacity: 64,
            timer: TimerConfig::default(),
            max_timeouts: 8,
        }
    }
}

impl SessionConfig {
    pub fn with_window_size(mut self, n: usize) -> Self {
        self.window_size = n;
        self
    }

    pub fn with_reorder_capacity(mut self, n: usize) -> Self {
        self.reorder_capacity = n;
        self
    }

    pub fn with_timer(mut self, timer: TimerConfig) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_max_timeouts(mut self, n: u32) -> Self {
        self.max_timeouts = n;
        self
    }
}

/// Errors raised by [`ReliableSession`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Local back-pressure: wait for acknowledgements before submitting more.
    #[error("send window full ({capacity} messages in flight)")]
    WindowFull { capacity: usize },
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("invalid session snapshot: {0}")]
    Snapshot(#[from] WireError),
}

// ---------------------------------------------------------------------------
// Event results
// ---------------------------------------------------------------------------

/// A message accepted into the send window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub seq: u32,
    /// Encoded datagram to transmit now.
    pub datagram: Vec<u8>,
}

/// Everything one inbound datagram produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Incoming {
    /// Messages to hand to the application, in order.
    pub delivered: Vec<Vec<u8>>,
    /// Number of outbound messages this datagram acknowledged.
    pub acked: usize,
    /// Acknowledgement datagram to send back, if any.
    pub reply: Option<Vec<u8>>,
    pub duplicate: bool,
    pub overflow: Option<ReorderOverflow>,
}

// ---------------------------------------------------------------------------
// ReliableSession
// ---------------------------------------------------------------------------

/// Go-Back-N state for one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableSession {
    sender: GbnSender,
    receiver: GbnReceiver,
    timer: RetransmitTimer,
    /// Time the head of the window has waited since it was (re)armed.
    waited: Duration,
    /// Consecutive timeouts without forward progress.
    timeouts: u32,
    max_timeouts: u32,
}

impl Default for ReliableSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl ReliableSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sender: GbnSender::new(0, config.window_size),
            receiver: GbnReceiver::new(0, config.reorder_capacity),
            timer: RetransmitTimer::new(config.timer),
            waited: Duration::ZERO,
            timeouts: 0,
            max_timeouts: config.max_timeouts,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn in_flight(&self) -> usize {
        self.sender.in_flight()
    }

    pub fn can_send(&self) -> bool {
        self.sender.can_send()
    }

    pub fn has_unacked(&self) -> bool {
        self.sender.has_unacked()
    }

    /// Sequence numbers and payloads still awaiting acknowledgement.
    pub fn unacked(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.sender
            .in_flight_entries()
            .map(|e| (e.seq, e.payload.as_slice()))
    }

    pub fn next_seq(&self) -> u32 {
        self.sender.next_seq()
    }

    pub fn expected_seq(&self) -> u32 {
        self.receiver.rcv_nxt()
    }

    /// Messages buffered ahead of a gap.
    pub fn reordered(&self) -> usize {
        self.receiver.buffered()
    }

    pub fn rto(&self) -> Duration {
        self.timer.rto()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.timer.srtt()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.timeouts
    }

    /// The peer stopped acknowledging; the owner should evict it.
    pub fn is_stalled(&self) -> bool {
        self.timeouts > self.max_timeouts
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append a message to the send window.
    pub fn submit(&mut self, payload: &[u8]) -> Result<Submitted, SessionError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()).into());
        }
        if !self.sender.has_unacked() {
            // First entry arms the timer.
            self.waited = Duration::ZERO;
        }
        let seq = self
            .sender
            .push(payload.to_vec())
            .ok_or(SessionError::WindowFull {
                capacity: self.sender.window_size(),
            })?;
        let datagram = self.data_datagram(seq, payload)?;
        log::trace!("[gbn] submit seq={seq} len={} in_flight={}", payload.len(), self.in_flight());
        Ok(Submitted { seq, datagram })
    }

    /// Decode and process one raw datagram from the peer.
    pub fn on_datagram(&mut self, raw: &[u8]) -> Result<Incoming, SessionError> {
        let packet = Packet::decode(raw)?;
        Ok(self.on_packet(&packet))
    }

    /// Process one decoded packet from the peer.
    pub fn on_packet(&mut self, packet: &Packet) -> Incoming {
        let h = &packet.header;
        let mut out = Incoming::default();

        if h.has(flags::ACK) {
            let ack = self.sender.on_ack(h.ack);
            if ack.retired > 0 {
                self.timeouts = 0;
                self.waited = Duration::ZERO;
                match ack.rtt_sample {
                    Some(rtt) => self.timer.record_rtt_sample(rtt),
                    None => self.timer.reset(),
                }
                log::trace!(
                    "[gbn] ack={} retired={} rto={:?}",
                    h.ack,
                    ack.retired,
                    self.timer.rto()
                );
            }
            out.acked = ack.retired;
        }

        if h.has(flags::DATA) {
            let rx = self.receiver.on_message(h.seq, packet.payload.clone());
            if let Some(overflow) = rx.overflow {
                log::debug!("[gbn] {overflow}");
            }
            if rx.duplicate {
                log::trace!("[gbn] duplicate seq={}", h.seq);
            }
            out.delivered = rx.delivered;
            out.duplicate = rx.duplicate;
            out.overflow = rx.overflow;
            out.reply = self.ack_datagram();
        }

        out
    }

    /// Advance time by `elapsed`; returns the datagrams to retransmit.
    ///
    /// When the head of the window has waited a full RTO, every
    /// unacknowledged message is resent once and the RTO backs off.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<Vec<u8>> {
        if !self.sender.has_unacked() {
            self.waited = Duration::ZERO;
            return Vec::new();
        }
        self.sender.age(elapsed);
        self.waited = self.waited.saturating_add(elapsed);
        if !self.timer.expired(self.waited) {
            return Vec::new();
        }

        let datagrams: Vec<Vec<u8>> = self
            .sender
            .in_flight_entries()
            .filter_map(|e| self.data_datagram(e.seq, &e.payload).ok())
            .collect();
        self.sender.on_retransmit();
        self.timer.back_off();
        self.waited = Duration::ZERO;
        self.timeouts += 1;
        log::debug!(
            "[gbn] timeout: retransmitting {} message(s), rto now {:?}",
            datagrams.len(),
            self.timer.rto()
        );
        datagrams
    }

    // -----------------------------------------------------------------------
    // Datagram builders
    // -----------------------------------------------------------------------

    fn ack_fields(&self) -> (u8, u32) {
        match self.receiver.ack_number() {
            Some(ack) => (flags::ACK, ack),
            None => (0, 0),
        }
    }

    fn data_datagram(&self, seq: u32, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let (ack_flag, ack) = self.ack_fields();
        Packet {
            header: Header {
                seq,
                ack,
                flags: flags::DATA | ack_flag,
                ..Header::default()
            },
            payload: payload.to_vec(),
        }
        .encode()
    }

    /// Pure acknowledgement for everything delivered so far.
    pub fn ack_datagram(&self) -> Option<Vec<u8>> {
        let ack = self.receiver.ack_number()?;
        Packet::control(flags::ACK, 0, ack).encode().ok()
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Capture window, reorder buffer, counters and timer state exactly.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u8(SNAPSHOT_VERSION)
            .u64(micros(self.waited))
            .u32(self.timeouts)
            .u32(self.max_timeouts);
        self.timer.write_to(&mut w);
        self.sender.write_to(&mut w);
        self.receiver.write_to(&mut w);
        w.finish()
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, SessionError> {
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != SNAPSHOT_VERSION {
            return Err(WireError::InvalidValue {
                field: "session snapshot version",
                value: u64::from(version),
            }
            .into());
        }
        let waited = Duration::from_micros(r.u64()?);
        let timeouts = r.u32()?;
        let max_timeouts = r.u32()?;
        let timer = RetransmitTimer::read_from(&mut r)?;
        let sender = GbnSender::read_from(&mut r)?;
        let receiver = GbnReceiver::read_from(&mut r)?;
        r.finish()?;
        Ok(Self {
            sender,
            receiver,
            timer,
            waited,
            timeouts,
            max_timeouts,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
