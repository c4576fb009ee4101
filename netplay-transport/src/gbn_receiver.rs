//! Go-Back-N receive-side state with a bounded reorder buffer.
//!
//! [`GbnReceiver`] delivers messages strictly in sequence order:
//!
//! - A message at `rcv_nxt` is delivered, then every buffered message that
//!   is now contiguous follows it.
//! - A message ahead of `rcv_nxt` is held in the reorder buffer.  When the
//!   buffer is full the entry that arrived earliest is dropped and reported;
//!   the sender's retransmission fills the gap later.
//! - A message behind `rcv_nxt`, or one already buffered, is a duplicate.
//!
//! After every data message the caller sends a **cumulative ACK** carrying
//! [`GbnReceiver::ack_number`], the last sequence delivered.

use std::collections::BTreeMap;

use crate::gbn_sender::seq_lt;
use crate::wire::{Reader, WireError, Writer};

/// An out-of-order message evicted from a full reorder buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reorder buffer full: dropped buffered message {dropped}")]
pub struct ReorderOverflow {
    pub dropped: u32,
}

/// What happened to one inbound message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Messages now deliverable, in order.
    pub delivered: Vec<Vec<u8>>,
    /// The message was seen before and was discarded.
    pub duplicate: bool,
    pub overflow: Option<ReorderOverflow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Buffered {
    arrival: u64,
    payload: Vec<u8>,
}

/// Go-Back-N receive-side state for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbnReceiver {
    /// Next expected sequence number.
    rcv_nxt: u32,
    /// Total messages delivered; ACKs are only meaningful once this is > 0.
    delivered: u64,
    reorder: BTreeMap<u32, Buffered>,
    capacity: usize,
    /// Monotonic arrival counter used to find the oldest buffered entry.
    arrivals: u64,
}

impl GbnReceiver {
    /// `capacity` is clamped to at least 1.
    pub fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            delivered: 0,
            reorder: BTreeMap::new(),
            capacity: capacity.max(1),
            arrivals: 0,
        }
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Last in-order sequence delivered, or `None` before the first delivery.
    pub fn ack_number(&self) -> Option<u32> {
        (self.delivered > 0).then(|| self.rcv_nxt.wrapping_sub(1))
    }

    /// Process an inbound data message.
    pub fn on_message(&mut self, seq: u32, payload: Vec<u8>) -> Received {
        let mut out = Received::default();

        if seq_lt(seq, self.rcv_nxt) || self.reorder.contains_key(&seq) {
            out.duplicate = true;
            return out;
        }

        if seq == self.rcv_nxt {
            out.delivered.push(payload);
            self.advance();
            while let Some(next) = self.reorder.remove(&self.rcv_nxt) {
                out.delivered.push(next.payload);
                self.advance();
            }
            return out;
        }

        if self.reorder.len() >= self.capacity {
            let oldest = self
                .reorder
                .iter()
                .min_by_key(|(_, b)| b.arrival)
                .map(|(seq, _)| *seq);
            if let Some(dropped) = oldest {
                self.reorder.remove(&dropped);
                out.overflow = Some(ReorderOverflow { dropped });
            }
        }
        self.arrivals += 1;
        self.reorder.insert(
            seq,
            Buffered {
                arrival: self.arrivals,
                payload,
            },
        );
        out
    }

    fn advance(&mut self) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.delivered += 1;
    }

    pub(crate) fn write_to(&self, w: &mut Writer) {
        w.u32(self.rcv_nxt)
            .u64(self.delivered)
            .u64(self.arrivals)
            .u32(self.capacity as u32)
            .u32(self.reorder.len() as u32);
        for (seq, b) in &self.reorder {
            w.u32(*seq).u64(b.arrival).bytes(&b.payload);
        }
    }

    pub(crate) fn read_from(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let rcv_nxt = r.u32()?;
        let delivered = r.u64()?;
        let arrivals = r.u64()?;
        let capacity = r.u32()? as usize;
        let count = r.u32()? as usize;
        if capacity == 0 || count > capacity {
            return Err(WireError::InvalidValue {
                field: "reorder buffer",
                value: count as u64,
            });
        }
        let mut reorder = BTreeMap::new();
        for _ in 0..count {
            let seq = r.u32()?;
            let arrival = r.u64()?;
            let payload = r.bytes()?;
            reorder.insert(seq, Buffered { arrival, payload });
        }
        Ok(Self {
            rcv_nxt,
            delivered,
            reorder,
            capacity,
            arrivals,
        })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
