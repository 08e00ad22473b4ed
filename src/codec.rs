//! Carrier framing
//!
//! Maps encoded segments onto the two DNS shapes the tunnel can ride in:
//!
//! - QNAME labels: base32 over the segment, chopped into labels of at most
//!   63 characters, one cache-busting nonce label, then the tunnel domain.
//!   Used for every query and for CNAME answers.
//! - TXT character-strings: base64 over the segment, split into chunks of
//!   at most 255 bytes inside a single TXT answer. Roughly five times the
//!   per-answer capacity of the label form.
//!
//! Base32 padding is dropped on encode and inferred from length on decode.
//! Label matching is case-insensitive since resolvers are free to randomize
//! QNAME case.

use crate::segment::{Segment, SegmentError, MIN_SEGMENT_LEN};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use data_encoding::BASE32_NOPAD;
use rand::Rng;
use thiserror::Error;

/// Longest permitted DNS label (RFC 1035).
pub const MAX_LABEL_LEN: usize = 63;

/// Longest permitted presentation-form name.
pub const MAX_QNAME_LEN: usize = 253;

/// Longest TXT character-string.
pub const MAX_TXT_CHUNK: usize = 255;

/// EDNS-safe ceiling for a UDP response (RFC 6891 guidance).
pub const MAX_UDP_RESPONSE_LEN: usize = 1232;

/// Length of the cache-busting nonce label appended before the domain.
const NONCE_LABEL_LEN: usize = 7;

const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("segment does not fit the carrier: {wire} bytes, capacity {capacity}")]
    Oversize { wire: usize, capacity: usize },

    #[error("name does not belong to the tunnel domain")]
    ForeignName,

    #[error("empty carrier frame")]
    Empty,

    #[error("base32 decode: {0}")]
    Base32(#[from] data_encoding::DecodeError),

    #[error("base64 decode: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Which DNS record type carries downstream segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carrier {
    Cname,
    Txt,
}

/// Encode a segment into a QNAME under `domain`.
///
/// The nonce label makes every query name unique so recursive resolvers
/// cannot answer from cache.
pub fn encode_labels(seg: &Segment, domain: &str) -> Result<String, CodecError> {
    let encoded = BASE32_NOPAD.encode(&seg.encode()).to_ascii_lowercase();

    let mut qname = String::with_capacity(encoded.len() + encoded.len() / MAX_LABEL_LEN + domain.len() + NONCE_LABEL_LEN + 2);
    for chunk in encoded.as_bytes().chunks(MAX_LABEL_LEN) {
        // chunks of an ASCII string are themselves ASCII
        qname.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        qname.push('.');
    }
    qname.push_str(&nonce_label());
    qname.push('.');
    qname.push_str(domain);

    if qname.len() > MAX_QNAME_LEN {
        return Err(CodecError::Oversize {
            wire: seg.wire_len(),
            capacity: max_label_payload(domain) + MIN_SEGMENT_LEN,
        });
    }
    Ok(qname)
}

/// Recover a segment from a QNAME produced by [`encode_labels`].
pub fn decode_labels(qname: &str, domain: &str) -> Result<Segment, CodecError> {
    let name = qname.trim_end_matches('.');
    let lower = name.to_ascii_lowercase();
    let suffix = format!(".{}", domain.to_ascii_lowercase());
    let prefix = lower
        .strip_suffix(&suffix)
        .ok_or(CodecError::ForeignName)?;

    let mut labels: Vec<&str> = prefix.split('.').collect();
    // Last data-bearing label is the nonce.
    if labels.pop().is_none() || labels.is_empty() {
        return Err(CodecError::Empty);
    }
    let joined: String = labels.concat().to_ascii_uppercase();
    let raw = BASE32_NOPAD.decode(joined.as_bytes())?;
    Ok(Segment::decode(&raw)?)
}

/// Encode a segment into TXT character-strings.
pub fn encode_txt(seg: &Segment) -> Vec<Vec<u8>> {
    let encoded = BASE64.encode(seg.encode());
    encoded
        .as_bytes()
        .chunks(MAX_TXT_CHUNK)
        .map(|c| c.to_vec())
        .collect()
}

/// Recover a segment from the character-strings of one TXT answer.
pub fn decode_txt(strings: &[Vec<u8>]) -> Result<Segment, CodecError> {
    if strings.is_empty() {
        return Err(CodecError::Empty);
    }
    let mut joined = Vec::new();
    for s in strings {
        joined.extend_from_slice(s);
    }
    let raw = BASE64.decode(&joined)?;
    Ok(Segment::decode(&raw)?)
}

/// Largest payload a single QNAME under `domain` can carry.
///
/// Works backwards from the 253-character name budget: domain and nonce
/// label first, then dots between data labels, then the base32 expansion,
/// then the segment header and trailer.
pub fn max_label_payload(domain: &str) -> usize {
    // Data characters plus one dot per data label share the name budget
    // with the nonce label and the domain.
    let budget = match MAX_QNAME_LEN.checked_sub(NONCE_LABEL_LEN + 1 + domain.len()) {
        Some(n) => n,
        None => return 0,
    };
    let mut raw = budget * 5 / 8;
    while raw > 0 {
        let chars = (raw * 8 + 4) / 5;
        let labels = (chars + MAX_LABEL_LEN - 1) / MAX_LABEL_LEN;
        if chars + labels <= budget {
            break;
        }
        raw -= 1;
    }
    raw.saturating_sub(MIN_SEGMENT_LEN)
}

/// Largest payload a single TXT answer can carry, given the length of the
/// query name that the response must echo.
pub fn max_txt_payload(qname_len: usize) -> usize {
    const DNS_HEADER: usize = 12;
    const QUESTION_FIXED: usize = 6; // label length framing + root + QTYPE + QCLASS
    const RR_FIXED: usize = 12; // compressed name + type + class + TTL + RDLENGTH

    let budget = MAX_UDP_RESPONSE_LEN
        .saturating_sub(DNS_HEADER + qname_len + QUESTION_FIXED + RR_FIXED);
    // one length octet per 255-byte character-string
    let b64_chars = budget * MAX_TXT_CHUNK / (MAX_TXT_CHUNK + 1);
    let raw = b64_chars / 4 * 3;
    raw.saturating_sub(MIN_SEGMENT_LEN)
}

/// Capacity of one answer for the given carrier.
pub fn max_answer_payload(carrier: Carrier, domain: &str) -> usize {
    match carrier {
        Carrier::Cname => max_label_payload(domain),
        // Assume the worst-case query name when sizing TXT answers.
        Carrier::Txt => max_txt_payload(MAX_QNAME_LEN),
    }
}

fn nonce_label() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LABEL_LEN)
        .map(|_| BASE32_ALPHABET[rng.gen_range(0..BASE32_ALPHABET.len())] as char)
        .collect()
}
