//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between endpoints carries exactly one [`Segment`].
//! This module is responsible for:
//! - Defining the on-wire binary layout (ports, sequence numbers, flags,
//!   window, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning errors
//!   for malformed or truncated input.
//! - Sequence-space accounting ([`Segment::seq_len`]) and wrap-around
//!   comparison ([`seq_lt`]).
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |        Destination Port       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |          Window Size          |  Payload Len  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Payload Len  |               Payload ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 17 bytes.
//! ports(4) + seq(4) + ack(4) + flags(1) + window(2) + payload_len(2)

use std::fmt;

use thiserror::Error;

/// Bit-flag constants for the `flags` header byte.
pub mod wire_flags {
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
    /// Every bit this protocol understands.
    pub const KNOWN: u8 = SYN | ACK | FIN;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 17;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_WINDOW: usize = 13;
const OFF_PAYLOAD_LEN: usize = 15;

/// Returns `true` when `a` precedes `b` in wrap-around sequence space.
///
/// Valid as long as the two values are less than `u32::MAX / 2` apart, which
/// always holds for a bounded window.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) <= u32::MAX / 2
}

/// The three independent control flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

impl Flags {
    pub const NONE: Flags = Flags { syn: false, ack: false, fin: false };
    pub const SYN: Flags = Flags { syn: true, ack: false, fin: false };
    pub const SYN_ACK: Flags = Flags { syn: true, ack: true, fin: false };
    pub const ACK: Flags = Flags { syn: false, ack: true, fin: false };
    pub const FIN: Flags = Flags { syn: false, ack: false, fin: true };

    fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.syn {
            b |= wire_flags::SYN;
        }
        if self.ack {
            b |= wire_flags::ACK;
        }
        if self.fin {
            b |= wire_flags::FIN;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            syn: b & wire_flags::SYN != 0,
            ack: b & wire_flags::ACK != 0,
            fin: b & wire_flags::FIN != 0,
        }
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if self.syn {
            parts.push("SYN");
        }
        if self.ack {
            parts.push("ACK");
        }
        if self.fin {
            parts.push("FIN");
        }
        if parts.is_empty() {
            write!(f, "DATA")
        } else {
            write!(f, "{}", parts.join("+"))
        }
    }
}

/// A complete protocol segment: header fields + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub source_port: u16,
    pub dest_port: u16,
    /// Sequence number of the first unit of sequence space this segment uses.
    pub seq: u32,
    /// Next sequence number expected from the peer (valid when `flags.ack`).
    pub ack: u32,
    pub flags: Flags,
    /// Advertised receive window, in segments.
    pub window: u16,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a segment without payload.
    pub fn control(source_port: u16, dest_port: u16, seq: u32, ack: u32, flags: Flags, window: u16) -> Self {
        Self {
            source_port,
            dest_port,
            seq,
            ack,
            flags,
            window,
            payload: Vec::new(),
        }
    }

    /// Units of sequence space this segment occupies.
    ///
    /// SYN or FIN occupy exactly one unit; a pure data segment occupies its
    /// payload length; a pure ACK occupies zero.
    pub fn seq_len(&self) -> u32 {
        if self.flags.syn || self.flags.fin {
            1
        } else {
            self.payload.len() as u32
        }
    }

    /// `true` for an ACK-only segment: no SYN, no FIN, no payload.
    pub fn is_pure_ack(&self) -> bool {
        self.flags == Flags::ACK && self.payload.is_empty()
    }

    /// `true` for a SYN without ACK or FIN.
    pub fn is_bare_syn(&self) -> bool {
        self.flags == Flags::SYN
    }

    /// `true` for a segment with no control flags set.
    pub fn is_data(&self) -> bool {
        self.flags == Flags::NONE
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// Fails only when the payload does not fit the 16-bit length field.
    pub fn encode(&self) -> Result<Vec<u8>, SegmentError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| SegmentError::PayloadTooLarge(self.payload.len()))?;
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.dest_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_FLAGS] = self.flags.to_byte();
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&payload_len.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the `payload_len` field disagrees with `buf.len()`, or
    /// - the flags byte carries bits this protocol does not define.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::BufferTooShort(buf.len()));
        }

        let source_port = read_u16(buf, OFF_SRC_PORT);
        let dest_port = read_u16(buf, OFF_DST_PORT);
        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let flag_byte = buf[OFF_FLAGS];
        let window = read_u16(buf, OFF_WINDOW);
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN) as usize;

        if flag_byte & !wire_flags::KNOWN != 0 {
            return Err(SegmentError::UnknownFlags(flag_byte));
        }
        if buf.len() != HEADER_LEN + payload_len {
            return Err(SegmentError::LengthMismatch {
                declared: payload_len,
                actual: buf.len() - HEADER_LEN,
            });
        }

        Ok(Segment {
            source_port,
            dest_port,
            seq,
            ack,
            flags: Flags::from_byte(flag_byte),
            window,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} seq={} ack={} win={} len={}",
            self.flags,
            self.source_port,
            self.dest_port,
            self.seq,
            self.ack,
            self.window,
            self.payload.len()
        )
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Errors that can arise when encoding or parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("buffer of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
    #[error("payload_len field says {declared} bytes but {actual} follow the header")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown flag bits in {0:#010b}")]
    UnknownFlags(u8),
    #[error("payload of {0} bytes exceeds the 16-bit length field")]
    PayloadTooLarge(usize),
}
