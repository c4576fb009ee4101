//! Go-Back-N send window.
//!
//! [`GbnSender`] numbers outgoing messages and keeps each one until a
//! cumulative ACK covers it. When the retransmission timer fires the caller
//! resends the whole window from the oldest unacked message onwards.
//!
//! Sequence numbers are u32 and wrap; see [`seq_le`]. Each in-flight entry
//! tracks its own age so an RTT sample can be taken on ACK, and ages survive
//! a snapshot. No encoding or I/O happens here.

use std::collections::VecDeque;
use std::time::Duration;

use crate::timer::micros;
use crate::wire::{Reader, WireError, Writer};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `a <= b` when the two are less than half the sequence space apart.
#[inline]
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) <= (u32::MAX / 2)
}

/// Strict form of [`seq_le`].
#[inline]
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    a != b && seq_le(a, b)
}

/// One unacknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub seq: u32,
    pub payload: Vec<u8>,
    /// Transmissions so far, the first send included.
    pub sends: u32,
    /// Time since the most recent transmission.
    pub age: Duration,
}

/// What a cumulative ACK retired.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    pub retired: usize,
    /// Age of the newest retired entry, unless it was ever resent (Karn).
    pub rtt_sample: Option<Duration>,
}

/// Send-side state for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbnSender {
    next_seq: u32,
    window_size: usize,
    /// Oldest first.
    flight: VecDeque<InFlight>,
}

impl GbnSender {
    /// `window_size` is clamped to at least 1.
    pub fn new(seq_start: u32, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            next_seq: seq_start,
            window_size,
            flight: VecDeque::with_capacity(window_size),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Oldest unacked sequence number, or `next_seq` when nothing is out.
    pub fn send_base(&self) -> u32 {
        self.flight.front().map_or(self.next_seq, |e| e.seq)
    }

    pub fn can_send(&self) -> bool {
        self.flight.len() < self.window_size
    }

    pub fn in_flight(&self) -> usize {
        self.flight.len()
    }

    pub fn has_unacked(&self) -> bool {
        !self.flight.is_empty()
    }

    /// Number and enqueue a message. `None` when the window is full.
    pub fn push(&mut self, payload: Vec<u8>) -> Option<u32> {
        if !self.can_send() {
            return None;
        }
        let seq = self.next_seq;
        self.flight.push_back(InFlight {
            seq,
            payload,
            sends: 1,
            age: Duration::ZERO,
        });
        self.next_seq = self.next_seq.wrapping_add(1);
        Some(seq)
    }

    /// Retire every entry up to and including `ack`.
    ///
    /// An ACK for a message never sent retires nothing; an old one finds
    /// nothing left to retire.
    pub fn on_ack(&mut self, ack: u32) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        if !seq_lt(ack, self.next_seq) {
            return outcome;
        }
        while let Some(entry) = self.flight.pop_front() {
            if !seq_le(entry.seq, ack) {
                self.flight.push_front(entry);
                break;
            }
            outcome.retired += 1;
            outcome.rtt_sample = (entry.sends == 1).then_some(entry.age);
        }
        outcome
    }

    /// In-flight messages, oldest first.
    pub fn in_flight_entries(&self) -> impl Iterator<Item = &InFlight> {
        self.flight.iter()
    }

    pub fn age(&mut self, elapsed: Duration) {
        for entry in self.flight.iter_mut() {
            entry.age = entry.age.saturating_add(elapsed);
        }
    }

    /// Record that the whole window has just been resent.
    pub fn on_retransmit(&mut self) {
        for entry in self.flight.iter_mut() {
            entry.sends += 1;
            entry.age = Duration::ZERO;
        }
    }

    pub(crate) fn write_to(&self, w: &mut Writer) {
        w.u32(self.next_seq)
            .u32(self.window_size as u32)
            .u32(self.flight.len() as u32);
        for entry in &self.flight {
            w.u32(entry.seq)
                .u32(entry.sends)
                .u64(micros(entry.age))
                .bytes(&entry.payload);
        }
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let next_seq = r.u32()?;
        let window_size = r.u32()? as usize;
        let count = r.u32()? as usize;
        if window_size == 0 || count > window_size {
            return Err(WireError::InvalidValue {
                field: "send window",
                value: count as u64,
            });
        }
        let mut flight = VecDeque::with_capacity(window_size);
        for _ in 0..count {
            flight.push_back(InFlight {
                seq: r.u32()?,
                sends: r.u32()?,
                age: Duration::from_micros(r.u64()?),
                payload: r.bytes()?,
            });
        }
        Ok(Self {
            next_seq,
            window_size,
            flight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(start: u32, n: usize) -> GbnSender {
        let mut s = GbnSender::new(start, 8);
        for i in 0..n {
            s.push(vec![i as u8]).unwrap();
        }
        s
    }

    #[test]
    fn empty_window_starts_at_seq_start() {
        let s = GbnSender::new(100, 4);
        assert_eq!((s.send_base(), s.next_seq()), (100, 100));
        assert!(s.can_send() && !s.has_unacked());
    }

    #[test]
    fn push_assigns_consecutive_sequences() {
        let mut s = GbnSender::new(0, 4);
        assert_eq!(s.push(b"a".to_vec()), Some(0));
        assert_eq!(s.push(b"b".to_vec()), Some(1));
        assert_eq!(s.next_seq(), 2);
        assert_eq!(s.send_base(), 0);
    }

    #[test]
    fn window_full_blocks_push() {
        let mut s = GbnSender::new(0, 2);
        s.push(vec![1]).unwrap();
        s.push(vec![2]).unwrap();
        assert!(!s.can_send());
        assert_eq!(s.push(vec![3]), None);
        assert_eq!(s.in_flight(), 2);
    }

    #[test]
    fn one_ack_retires_everything_it_covers() {
        let mut s = filled(0, 3);
        let out = s.on_ack(2);
        assert_eq!(out.retired, 3);
        assert!(!s.has_unacked());
        assert_eq!(s.send_base(), 3);
    }

    #[test]
    fn ack_inside_window_keeps_the_rest() {
        let mut s = filled(0, 3);
        assert_eq!(s.on_ack(1).retired, 2);
        assert_eq!(s.send_base(), 2);
        assert_eq!(s.in_flight(), 1);
    }

    #[test]
    fn duplicate_ack_retires_nothing() {
        let mut s = filled(0, 2);
        assert_eq!(s.on_ack(0).retired, 1);
        assert_eq!(s.on_ack(0).retired, 0);
    }

    #[test]
    fn ack_for_unsent_message_is_ignored() {
        let mut s = filled(0, 2);
        assert_eq!(s.on_ack(1000).retired, 0);
        assert_eq!(s.in_flight(), 2);
    }

    #[test]
    fn karn_skips_retransmitted_entries() {
        let mut s = filled(0, 2);
        s.age(Duration::from_millis(40));
        s.on_retransmit();
        s.age(Duration::from_millis(10));
        let out = s.on_ack(1);
        assert_eq!(out.retired, 2);
        assert_eq!(out.rtt_sample, None);
    }

    #[test]
    fn rtt_sample_uses_newest_retired_entry() {
        let mut s = GbnSender::new(0, 4);
        s.push(vec![0]).unwrap();
        s.age(Duration::from_millis(30));
        s.push(vec![1]).unwrap();
        s.age(Duration::from_millis(20));
        let out = s.on_ack(1);
        assert_eq!(out.rtt_sample, Some(Duration::from_millis(20)));
    }

    #[test]
    fn on_retransmit_increments_sends() {
        let mut s = filled(0, 1);
        s.age(Duration::from_millis(5));
        s.on_retransmit();
        let entry = s.in_flight_entries().next().unwrap();
        assert_eq!(entry.sends, 2);
        assert_eq!(entry.age, Duration::ZERO);
    }

    #[test]
    fn window_spans_sequence_wrap() {
        let start = u32::MAX - 1;
        let mut s = filled(start, 4);
        assert_eq!(s.next_seq(), 2);
        // ack for seq 0 covers MAX-1, MAX and 0.
        assert_eq!(s.on_ack(0).retired, 3);
        assert_eq!(s.send_base(), 1);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut s = filled(7, 3);
        s.age(Duration::from_millis(12));
        let mut w = Writer::new();
        s.write_to(&mut w);
        let bytes = w.finish();
        let mut r = Reader::new(&bytes);
        assert_eq!(GbnSender::read_from(&mut r).unwrap(), s);
    }
}
