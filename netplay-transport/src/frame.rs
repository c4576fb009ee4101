//! Length-prefixed message framing for byte-stream paths.
//!
//! Stream and relayed transports carry a continuous byte stream, so message
//! boundaries are restored with a small frame header.  Datagram paths do not
//! need it: every message the reliable session delivers is already whole.
//!
//! # Wire format
//!
//! ```text
//!  0       2      3               7        9
//! +-------+------+---------------+--------+----------------+
//! | magic | kind |    length     | check  |  body (length) |
//! +-------+------+---------------+--------+----------------+
//! ```
//!
//! `magic` is [`MAGIC`], `length` counts body bytes only and `check` is the
//! RFC 1071 checksum of the body.  A header that fails any check does not
//! drop the connection: [`ReadBuffer::next_frame`] steps one byte forward and
//! tries again, so the reader resynchronises on the next valid frame.

use crate::address::NetworkAddress;
use crate::packet::internet_checksum;
use crate::wire::{Reader, WireError};

/// Frame marker ("NP").
pub const MAGIC: u16 = 0x4e50;

/// Byte length of the frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest body a frame may declare.
pub const MAX_FRAME: usize = 1 << 20;

/// Frame type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Hello = 1,
    RelayRequest = 2,
    RelayAccept = 3,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Data,
            1 => Self::Hello,
            2 => Self::RelayRequest,
            3 => Self::RelayAccept,
            _ => return None,
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application message.
    Data(Vec<u8>),
    /// First frame on a smart stream; tells the acceptor which path the
    /// connecting peer chose.
    Hello { relayed: bool },
    /// Ask a relay to open a tunnel to `destination`.
    RelayRequest { destination: NetworkAddress },
    /// The relay reached the destination; bytes now flow end to end.
    RelayAccept,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Data(_) => FrameKind::Data,
            Self::Hello { .. } => FrameKind::Hello,
            Self::RelayRequest { .. } => FrameKind::RelayRequest,
            Self::RelayAccept => FrameKind::RelayAccept,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Self::Data(payload) => payload.clone(),
            Self::Hello { relayed } => vec![u8::from(*relayed)],
            Self::RelayRequest { destination } => destination.encode(),
            Self::RelayAccept => Vec::new(),
        };
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(self.kind() as u8);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&internet_checksum(&body).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode_body(kind: FrameKind, body: &[u8]) -> Result<Self, WireError> {
        match kind {
            FrameKind::Data => Ok(Self::Data(body.to_vec())),
            FrameKind::Hello => {
                let mut r = Reader::new(body);
                let relayed = r.bool()?;
                r.finish()?;
                Ok(Self::Hello { relayed })
            }
            FrameKind::RelayRequest => Ok(Self::RelayRequest {
                destination: NetworkAddress::decode(body)?,
            }),
            FrameKind::RelayAccept => Reader::new(body).finish().map(|()| Self::RelayAccept),
        }
    }
}

/// Outcome of looking for a frame at the start of a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum Demarcation {
    /// A complete frame and the number of bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// The bytes so far are a valid prefix; wait for more.
    Incomplete,
    /// The slice does not start with a valid frame.
    Invalid,
}

/// Try to demarcate one frame at the start of `buf`.
pub fn demarcate(buf: &[u8]) -> Demarcation {
    if buf.len() < 2 {
        return match buf {
            [] => Demarcation::Incomplete,
            [b] if *b == MAGIC.to_be_bytes()[0] => Demarcation::Incomplete,
            _ => Demarcation::Invalid,
        };
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != MAGIC {
        return Demarcation::Invalid;
    }
    if buf.len() < FRAME_HEADER_LEN {
        return Demarcation::Incomplete;
    }
    let r = HeaderView::new(buf);
    let Some(kind) = FrameKind::from_u8(r.byte(2)) else {
        return Demarcation::Invalid;
    };
    let len = r.be32(3) as usize;
    if len > MAX_FRAME {
        return Demarcation::Invalid;
    }
    let check = r.be16(7);
    if buf.len() < FRAME_HEADER_LEN + len {
        return Demarcation::Incomplete;
    }
    let body = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
    if internet_checksum(body) != check {
        return Demarcation::Invalid;
    }
    match Frame::decode_body(kind, body) {
        Ok(frame) => Demarcation::Frame {
            frame,
            consumed: FRAME_HEADER_LEN + len,
        },
        Err(_) => Demarcation::Invalid,
    }
}

/// Offset reads over a slice already known to hold a full header.
struct HeaderView<'a>(&'a [u8]);

impl<'a> HeaderView<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    fn byte(&self, off: usize) -> u8 {
        self.0[off]
    }

    fn be16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.0[off], self.0[off + 1]])
    }

    fn be32(&self, off: usize) -> u32 {
        u32::from_be_bytes([self.0[off], self.0[off + 1], self.0[off + 2], self.0[off + 3]])
    }
}

// ---------------------------------------------------------------------------
// ReadBuffer
// ---------------------------------------------------------------------------

/// Inbound bytes plus the read cursor.
///
/// Framed readers pull whole frames with [`next_frame`](Self::next_frame);
/// raw readers look at [`unread`](Self::unread) and advance with
/// [`consume`](Self::consume).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBuffer {
    bytes: Vec<u8>,
    pos: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from captured bytes and cursor; the cursor is clamped.
    pub fn from_parts(bytes: Vec<u8>, pos: usize) -> Self {
        let pos = pos.min(bytes.len());
        Self { bytes, pos }
    }

    /// Whole buffer including already consumed bytes still held.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn unread(&self) -> &[u8] {
        &self.bytes[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.compact();
        self.bytes.extend_from_slice(data);
    }

    /// Advance the cursor by up to `n` bytes; returns how far it moved.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.bytes.len() - self.pos);
        self.pos += n;
        n
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.pos = 0;
    }

    /// Drop consumed bytes from the front.
    fn compact(&mut self) {
        if self.pos > 0 {
            self.bytes.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Demarcate the next frame, skipping one byte past every invalid header.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let mut skipped = 0usize;
        let frame = loop {
            match demarcate(self.unread()) {
                Demarcation::Frame { frame, consumed } => {
                    self.pos += consumed;
                    break Some(frame);
                }
                Demarcation::Incomplete => break None,
                Demarcation::Invalid => {
                    self.pos += 1;
                    skipped += 1;
                }
            }
        };
        if skipped > 0 {
            log::warn!("[frame] skipped {skipped} byte(s) resynchronising");
        }
        frame
    }
}
