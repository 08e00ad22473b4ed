//! Transport segments
//!
//! The tunnel's PDU. A segment carries a slice of one direction of a byte
//! stream together with the cursors both ends need to keep the stream
//! reliable over a lossy carrier.
//!
//! Wire layout (network byte order):
//!
//! ```text
//! ID(2) | SeqNum(4) | AckNum(4) | Flags(1) | DataLen(2) | Reason(1)
//! DataLen bytes of payload
//! CRC-32 over header + payload (4)
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io::Cursor;
use std::ops::BitOr;
use thiserror::Error;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 14;

/// CRC-32 trailer size in bytes.
pub const TRAILER_LEN: usize = 4;

/// Smallest well-formed segment (empty payload).
pub const MIN_SEGMENT_LEN: usize = HEADER_LEN + TRAILER_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SegmentError {
    #[error("segment too short: {0} bytes")]
    TooShort(usize),

    #[error("declared payload length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("unknown flag bits: {0:#04x}")]
    UnknownFlags(u8),

    #[error("SYN and FIN may not co-occur")]
    SynAndFin,

    #[error("RST may not carry data")]
    RstWithData,
}

/// Segment flag bitset.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const SYN: Flags = Flags(0x01);
    pub const ACK: Flags = Flags(0x02);
    pub const FIN: Flags = Flags(0x04);
    pub const RST: Flags = Flags(0x08);
    pub const KEEP_ALIVE: Flags = Flags(0x10);
    pub const CONFIG_ECHO: Flags = Flags(0x20);

    const MASK: u8 = 0x3f;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Flags, SegmentError> {
        if bits & !Self::MASK != 0 {
            return Err(SegmentError::UnknownFlags(bits));
        }
        Ok(Flags(bits))
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::KEEP_ALIVE, "KA"),
            (Flags::CONFIG_ECHO, "CFG"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Why a connection was reset. Carried in the reserved header octet of RST
/// segments; zero everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetReason {
    None = 0,
    AuthFailed = 1,
    ConnectFailed = 2,
    RetryExhausted = 3,
    LifetimeExpired = 4,
    UnknownConnection = 5,
    Cancelled = 6,
}

impl ResetReason {
    pub fn from_u8(v: u8) -> ResetReason {
        match v {
            1 => ResetReason::AuthFailed,
            2 => ResetReason::ConnectFailed,
            3 => ResetReason::RetryExhausted,
            4 => ResetReason::LifetimeExpired,
            5 => ResetReason::UnknownConnection,
            6 => ResetReason::Cancelled,
            _ => ResetReason::None,
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResetReason::None => "reset by peer",
            ResetReason::AuthFailed => "authentication failed",
            ResetReason::ConnectFailed => "upstream connect failed",
            ResetReason::RetryExhausted => "retransmission budget exhausted",
            ResetReason::LifetimeExpired => "connection lifetime expired",
            ResetReason::UnknownConnection => "unknown connection",
            ResetReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One transport PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Connection identifier, chosen by the initiator.
    pub id: u16,
    /// Byte offset of the first payload byte within the sender's stream.
    pub seq: u32,
    /// Next byte offset the sender expects to receive.
    pub ack: u32,
    pub flags: Flags,
    /// Reset reason on RST segments, zero otherwise.
    pub reason: u8,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn new(id: u16, seq: u32, ack: u32, flags: Flags, data: Vec<u8>) -> Segment {
        Segment {
            id,
            seq,
            ack,
            flags,
            reason: 0,
            data,
        }
    }

    /// Empty segment acknowledging up to `ack`.
    pub fn ack_only(id: u16, seq: u32, ack: u32) -> Segment {
        Segment::new(id, seq, ack, Flags::ACK, Vec::new())
    }

    /// Empty keep-alive carrying the current acknowledgement cursor.
    pub fn keep_alive(id: u16, seq: u32, ack: u32) -> Segment {
        Segment::new(id, seq, ack, Flags::KEEP_ALIVE | Flags::ACK, Vec::new())
    }

    pub fn rst(id: u16, reason: ResetReason) -> Segment {
        Segment {
            id,
            seq: 0,
            ack: 0,
            flags: Flags::RST,
            reason: reason as u8,
            data: Vec::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        MIN_SEGMENT_LEN + self.data.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u16(self.id);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.data.len() as u16);
        buf.put_u8(self.reason);
        buf.put_slice(&self.data);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Segment, SegmentError> {
        if raw.len() < MIN_SEGMENT_LEN {
            return Err(SegmentError::TooShort(raw.len()));
        }

        let body_len = raw.len() - TRAILER_LEN;
        let expected = u32::from_be_bytes([
            raw[body_len],
            raw[body_len + 1],
            raw[body_len + 2],
            raw[body_len + 3],
        ]);
        if crc32fast::hash(&raw[..body_len]) != expected {
            return Err(SegmentError::ChecksumMismatch);
        }

        let mut cursor = Cursor::new(&raw[..body_len]);
        let id = cursor.get_u16();
        let seq = cursor.get_u32();
        let ack = cursor.get_u32();
        let flags = Flags::from_bits(cursor.get_u8())?;
        let data_len = cursor.get_u16() as usize;
        let reason = cursor.get_u8();

        if data_len != cursor.remaining() {
            return Err(SegmentError::LengthMismatch {
                declared: data_len,
                available: cursor.remaining(),
            });
        }
        let mut data = vec![0u8; data_len];
        cursor.copy_to_slice(&mut data);

        if flags.contains(Flags::SYN) && flags.contains(Flags::FIN) {
            return Err(SegmentError::SynAndFin);
        }
        if flags.contains(Flags::RST) && !data.is_empty() {
            return Err(SegmentError::RstWithData);
        }

        Ok(Segment {
            id,
            seq,
            ack,
            flags,
            reason,
            data,
        })
    }
}
