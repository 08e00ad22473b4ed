// DNS wire format for the tunnel daemon and the query side.
//
// Implements just enough of the protocol to serve an authoritative zone of
// CNAME/TXT answers and to issue queries through recursive resolvers.

pub mod message;

pub use message::{Header, Message, QType, Question, Record, FLAG_TC};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("unsupported record type: {0}")]
    UnsupportedType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DnsError>;
