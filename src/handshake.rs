//! Tunnel-open handshake frames.
//!
//! The initiator's SYN carries a [`TunnelRequest`]: the OTP code, the mode,
//! its segment-length proposals and the target endpoint. The responder's
//! SYN+ACK carries a [`ConfigEcho`] with the lengths it actually granted;
//! the echo is authoritative and the initiator adopts it unconditionally.
//!
//! Layout of the request (network byte order):
//!
//! ```text
//! OTP(4) | mode(1) | upstream(2) | downstream(2) | port(2) | hostLen(1) | host
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown tunnel mode: {0}")]
    UnknownMode(u8),

    #[error("host length {declared} exceeds available {available} bytes")]
    BadHostLength { declared: usize, available: usize },

    #[error("host is not ASCII")]
    NonAsciiHost,

    #[error("host too long: {0} bytes")]
    HostTooLong(usize),
}

/// What the dispatcher should do with the accepted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelMode {
    /// Bridge the stream to a TCP connection toward the requested target.
    Stream = 0,
    /// Bridge the stream to the responder's configured upstream resolver;
    /// payload bytes use DNS-over-TCP length framing.
    DnsRelay = 1,
}

impl TunnelMode {
    fn from_u8(v: u8) -> Result<TunnelMode, HandshakeError> {
        match v {
            0 => Ok(TunnelMode::Stream),
            1 => Ok(TunnelMode::DnsRelay),
            other => Err(HandshakeError::UnknownMode(other)),
        }
    }
}

/// SYN payload sent by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub otp: u32,
    pub mode: TunnelMode,
    /// Proposed payload bytes per query.
    pub upstream_seg_len: u16,
    /// Proposed payload bytes per answer.
    pub downstream_seg_len: u16,
    pub port: u16,
    pub host: String,
}

impl TunnelRequest {
    const FIXED_LEN: usize = 12;

    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        if self.host.len() > u8::MAX as usize {
            return Err(HandshakeError::HostTooLong(self.host.len()));
        }
        if !self.host.is_ascii() {
            return Err(HandshakeError::NonAsciiHost);
        }
        let mut buf = BytesMut::with_capacity(Self::FIXED_LEN + self.host.len());
        buf.put_u32(self.otp);
        buf.put_u8(self.mode as u8);
        buf.put_u16(self.upstream_seg_len);
        buf.put_u16(self.downstream_seg_len);
        buf.put_u16(self.port);
        buf.put_u8(self.host.len() as u8);
        buf.put_slice(self.host.as_bytes());
        Ok(buf.to_vec())
    }

    pub fn decode(raw: &[u8]) -> Result<TunnelRequest, HandshakeError> {
        if raw.len() < Self::FIXED_LEN {
            return Err(HandshakeError::TooShort(raw.len()));
        }
        let mut cursor = Cursor::new(raw);
        let otp = cursor.get_u32();
        let mode = TunnelMode::from_u8(cursor.get_u8())?;
        let upstream_seg_len = cursor.get_u16();
        let downstream_seg_len = cursor.get_u16();
        let port = cursor.get_u16();
        let host_len = cursor.get_u8() as usize;
        if cursor.remaining() != host_len {
            return Err(HandshakeError::BadHostLength {
                declared: host_len,
                available: cursor.remaining(),
            });
        }
        let mut host_bytes = vec![0u8; host_len];
        cursor.copy_to_slice(&mut host_bytes);
        let host = String::from_utf8(host_bytes).map_err(|_| HandshakeError::NonAsciiHost)?;
        if !host.is_ascii() {
            return Err(HandshakeError::NonAsciiHost);
        }
        Ok(TunnelRequest {
            otp,
            mode,
            upstream_seg_len,
            downstream_seg_len,
            port,
            host,
        })
    }
}

/// SYN+ACK payload: the segment lengths the responder granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigEcho {
    pub upstream_seg_len: u16,
    pub downstream_seg_len: u16,
}

impl ConfigEcho {
    const LEN: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16(self.upstream_seg_len);
        buf.put_u16(self.downstream_seg_len);
        buf.to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<ConfigEcho, HandshakeError> {
        if raw.len() < Self::LEN {
            return Err(HandshakeError::TooShort(raw.len()));
        }
        let mut cursor = Cursor::new(raw);
        Ok(ConfigEcho {
            upstream_seg_len: cursor.get_u16(),
            downstream_seg_len: cursor.get_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = TunnelRequest {
            otp: 0x7fff_abcd,
            mode: TunnelMode::Stream,
            upstream_seg_len: 120,
            downstream_seg_len: 650,
            port: 443,
            host: "captive.apple.com".to_string(),
        };
        let raw = req.encode().unwrap();
        assert_eq!(TunnelRequest::decode(&raw).unwrap(), req);
    }

    #[test]
    fn relay_request_round_trip() {
        let req = TunnelRequest {
            otp: 1,
            mode: TunnelMode::DnsRelay,
            upstream_seg_len: 100,
            downstream_seg_len: 100,
            port: 0,
            host: String::new(),
        };
        let raw = req.encode().unwrap();
        assert_eq!(TunnelRequest::decode(&raw).unwrap(), req);
    }

    #[test]
    fn truncated_request_rejected() {
        let raw = TunnelRequest {
            otp: 9,
            mode: TunnelMode::Stream,
            upstream_seg_len: 1,
            downstream_seg_len: 1,
            port: 80,
            host: "example.test".to_string(),
        }
        .encode()
        .unwrap();
        assert!(TunnelRequest::decode(&raw[..raw.len() - 1]).is_err());
        assert!(TunnelRequest::decode(&raw[..4]).is_err());
    }

    #[test]
    fn unknown_mode_rejected() {
        let mut raw = TunnelRequest {
            otp: 9,
            mode: TunnelMode::Stream,
            upstream_seg_len: 1,
            downstream_seg_len: 1,
            port: 80,
            host: String::new(),
        }
        .encode()
        .unwrap();
        raw[4] = 0xee;
        assert_eq!(
            TunnelRequest::decode(&raw),
            Err(HandshakeError::UnknownMode(0xee))
        );
    }

    #[test]
    fn echo_round_trip() {
        let echo = ConfigEcho {
            upstream_seg_len: 110,
            downstream_seg_len: 640,
        };
        assert_eq!(ConfigEcho::decode(&echo.encode()).unwrap(), echo);
    }
}
