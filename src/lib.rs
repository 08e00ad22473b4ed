//! dnspipe: a TCP byte-stream tunnel carried by ordinary DNS.
//!
//! dnspipe moves arbitrary TCP traffic through recursive DNS resolvers.
//! The client side exposes a plain HTTP proxy; every proxied connection is
//! chopped into transport segments, each segment rides inside one DNS query
//! (base32 in QNAME labels) and one answer (CNAME labels or TXT strings),
//! and a small reliability layer puts the stream back together on the far
//! side, where an authoritative DNS daemon bridges it to the real target.
//!
//! ## Architecture
//!
//! ```text
//! browser ──> HTTP proxy ──> TransmissionControl ──> DNS queries
//!                                                        │ recursive
//!                                                        ▼ resolvers
//! origin  <── dispatcher <── TransmissionControl <── DNS daemon
//! ```
//!
//! Tunnel establishment is authorised by a shared TOTP secret; segment
//! sizes for both directions are negotiated during the handshake (TXT
//! answers carry roughly five times as much as CNAME answers). An optional
//! relay wraps plain DNS lookups from the local machine into the same
//! tunnel.
//!
//! ## Quick start
//!
//! ```bash
//! # authoritative side, on the host the NS record points at
//! dnspipe server --listen 0.0.0.0:53 --dns-name t.example.com --otp-secret <base32>
//!
//! # client side
//! dnspipe client --port 8080 --dns-name t.example.com --otp-secret <base32> \
//!     --resolver 1.1.1.1:53 --enable-txt
//! ```

pub mod codec;
pub mod config;
pub mod dns;
pub mod handshake;
pub mod initiator;
pub mod otp;
pub mod proxy;
pub mod relay;
pub mod responder;
pub mod segment;
pub mod supervisor;
pub mod tc;

pub use codec::Carrier;
pub use config::ServerConfig;
pub use handshake::{ConfigEcho, TunnelMode, TunnelRequest};
pub use initiator::{Initiator, InitiatorConfig};
pub use otp::TotpSecret;
pub use proxy::HttpProxy;
pub use relay::DnsRelay;
pub use responder::{DnsDaemon, ResponderConfig};
pub use segment::{Flags, ResetReason, Segment};
pub use tc::{TcConfig, TcError, TransmissionControl};

use thiserror::Error;

/// Errors crossing module boundaries.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    #[error(transparent)]
    Dns(#[from] dns::DnsError),

    #[error(transparent)]
    Handshake(#[from] handshake::HandshakeError),

    #[error(transparent)]
    Transmission(#[from] tc::TcError),

    #[error("query timed out")]
    QueryTimeout,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
