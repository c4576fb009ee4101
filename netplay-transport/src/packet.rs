//! Wire format for datagrams exchanged by reliable sessions.
//!
//! Every UDP datagram the datagram transport sends is a [`Packet`]: a fixed
//! header followed by an opaque payload.  Sequence numbers count *messages*,
//! not bytes; the acknowledgment field names the highest message delivered
//! in order and is only meaningful when [`flags::ACK`] is set.
//!
//! # Wire format
//!
//! ```text
//! offset  size  field
//!      0     4  seq          (big-endian)
//!      4     4  ack
//!      8     1  flags        SYN | ACK | FIN | DATA
//!      9     2  payload_len
//!     11     2  checksum     RFC 1071, over header and payload
//!     13     *  payload
//! ```

use crate::wire::{Reader, WireError, Writer};

/// Bits of [`Header::flags`].
pub mod flags {
    /// Handshake: connect request, or with [`ACK`] the reply.
    pub const SYN: u8 = 0b0000_0001;
    /// `ack` is meaningful.
    pub const ACK: u8 = 0b0000_0010;
    /// Sender is tearing the session down.
    pub const FIN: u8 = 0b0000_0100;
    /// Packet carries an application message at `seq`.
    pub const DATA: u8 = 0b0000_1000;
}

/// Header size in bytes.
pub const HEADER_LEN: usize = 13;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Position of the checksum inside the header.
const CHECKSUM_AT: usize = 11;

/// Decoded header.
///
/// `payload_len` and `checksum` are derived by [`Packet::encode`] and only
/// populated by [`Packet::decode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Message sequence number (valid with [`flags::DATA`]).
    pub seq: u32,
    /// Highest in-order message delivered by the sender of this packet.
    pub ack: u32,
    pub flags: u8,
    pub payload_len: u16,
    /// Covers header and payload, computed with this field zeroed.
    pub checksum: u16,
}

impl Header {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// One datagram on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Control packet with no payload.
    pub fn control(flags: u8, seq: u32, ack: u32) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                ..Header::default()
            },
            payload: Vec::new(),
        }
    }

    pub fn syn() -> Self {
        Self::control(flags::SYN, 0, 0)
    }

    pub fn syn_ack() -> Self {
        Self::control(flags::SYN | flags::ACK, 0, 0)
    }

    pub fn fin() -> Self {
        Self::control(flags::FIN, 0, 0)
    }

    pub fn is_syn(&self) -> bool {
        self.header.has(flags::SYN) && !self.header.has(flags::ACK)
    }

    pub fn is_syn_ack(&self) -> bool {
        self.header.has(flags::SYN) && self.header.has(flags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.header.has(flags::FIN)
    }

    /// Serialise header and payload.
    ///
    /// Fails if the payload does not fit in the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| PacketError::PayloadTooLarge(self.payload.len()))?;
        let mut w = Writer::new();
        w.u32(self.header.seq)
            .u32(self.header.ack)
            .u8(self.header.flags)
            .u16(len)
            .u16(0);
        let mut out = w.finish();
        out.extend_from_slice(&self.payload);
        let sum = internet_checksum(&out);
        out[CHECKSUM_AT..HEADER_LEN].copy_from_slice(&sum.to_be_bytes());
        Ok(out)
    }

    /// Parse one datagram.
    ///
    /// The length field must account for every byte after the header, and
    /// the checksum is recomputed with its own field zeroed.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        let (head, payload) = buf.split_at(HEADER_LEN);
        let header = read_header(head).map_err(|_| PacketError::BufferTooShort)?;
        if usize::from(header.payload_len) != payload.len() {
            return Err(PacketError::LengthMismatch);
        }

        let mut zeroed = buf.to_vec();
        zeroed[CHECKSUM_AT..HEADER_LEN].fill(0);
        if internet_checksum(&zeroed) != header.checksum {
            return Err(PacketError::ChecksumFailed);
        }
        Ok(Packet {
            header,
            payload: payload.to_vec(),
        })
    }
}

fn read_header(head: &[u8]) -> Result<Header, WireError> {
    let mut r = Reader::new(head);
    Ok(Header {
        seq: r.u32()?,
        ack: r.u32()?,
        flags: r.u8()?,
        payload_len: r.u16()?,
        checksum: r.u16()?,
    })
}

/// Reasons a datagram cannot be built or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("payload of {0} bytes does not fit in one packet")]
    PayloadTooLarge(usize),
}

/// RFC 1071 one's-complement sum of big-endian 16-bit words.
///
/// Any checksum field inside `data` must already be zero.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        // Fold eagerly so large payloads cannot overflow the accumulator.
        sum = (sum & 0xffff) + (sum >> 16);
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet(seq: u32, ack: u32, payload: &[u8]) -> Packet {
        Packet {
            header: Header {
                seq,
                ack,
                flags: flags::DATA | flags::ACK,
                ..Header::default()
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let pkt = data_packet(42, 41, b"hello");
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.seq, 42);
        assert_eq!(decoded.header.ack, 41);
        assert_eq!(decoded.header.flags, flags::DATA | flags::ACK);
        assert_eq!(decoded.header.payload_len, 5);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn malformed_datagrams_are_rejected() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::BufferTooShort));
        assert_eq!(
            Packet::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort)
        );

        let good = data_packet(99, 0, b"test").encode().unwrap();
        let truncated = &good[..good.len() - 1];
        assert_eq!(Packet::decode(truncated), Err(PacketError::LengthMismatch));

        let mut flipped = good.clone();
        flipped[2] ^= 0x40;
        assert_eq!(Packet::decode(&flipped), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn control_packets_classify() {
        let syn = Packet::decode(&Packet::syn().encode().unwrap()).unwrap();
        assert!(syn.is_syn() && !syn.is_syn_ack());
        let syn_ack = Packet::decode(&Packet::syn_ack().encode().unwrap()).unwrap();
        assert!(syn_ack.is_syn_ack() && !syn_ack.is_syn());
        assert!(Packet::fin().is_fin());
    }

    #[test]
    fn oversized_payload_rejected() {
        let pkt = data_packet(0, 0, &vec![0u8; MAX_PAYLOAD + 1]);
        assert_eq!(
            pkt.encode(),
            Err(PacketError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = data_packet(0x0102_0304, 0x0506_0708, b"xy").encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 2);
        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes[8], flags::DATA | flags::ACK);
        assert_eq!(&bytes[9..11], &[0, 2]);
        assert_eq!(&bytes[HEADER_LEN..], b"xy");
    }

    #[test]
    fn checksum_of_odd_length_input() {
        // 0x0100 + 0x0200 (padded) = 0x0300 -> !0x0300
        assert_eq!(internet_checksum(&[0x01, 0x00, 0x02]), !0x0300);
    }
}
