//! Time-based one-time passwords for tunnel authorisation.
//!
//! Standard TOTP over HMAC-SHA1 with 30-second steps. The full 31-bit
//! dynamically-truncated value travels in the handshake frame; no decimal
//! truncation is applied since both ends are machines. Verification accepts
//! the current step plus one step of skew in either direction.

use data_encoding::BASE32_NOPAD;
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// TOTP step length.
pub const STEP_SECS: u64 = 30;

/// Accepted clock skew, in steps, on either side.
pub const SKEW_STEPS: i64 = 1;

#[derive(Error, Debug)]
pub enum OtpError {
    #[error("secret is not valid base32: {0}")]
    BadSecret(data_encoding::DecodeError),

    #[error("secret is empty")]
    EmptySecret,
}

/// Shared TOTP secret.
#[derive(Clone)]
pub struct TotpSecret {
    key: hmac::Key,
}

impl TotpSecret {
    /// Parses a base32 secret (case-insensitive, padding optional).
    pub fn from_base32(s: &str) -> Result<TotpSecret, OtpError> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '=' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(OtpError::EmptySecret);
        }
        let raw = BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(OtpError::BadSecret)?;
        Ok(TotpSecret {
            key: hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, &raw),
        })
    }

    /// Code for the step containing `unix_secs`.
    pub fn code_at(&self, unix_secs: u64) -> u32 {
        self.code_for_step(unix_secs / STEP_SECS)
    }

    /// Code for the current wall-clock step.
    pub fn current(&self) -> u32 {
        self.code_at(now_unix())
    }

    /// Accepts `code` if it matches the step containing `unix_secs` or a
    /// neighbouring step within [`SKEW_STEPS`].
    pub fn verify_at(&self, code: u32, unix_secs: u64) -> bool {
        let step = (unix_secs / STEP_SECS) as i64;
        (-SKEW_STEPS..=SKEW_STEPS).any(|delta| {
            let candidate = step + delta;
            candidate >= 0 && self.code_for_step(candidate as u64) == code
        })
    }

    pub fn verify(&self, code: u32) -> bool {
        self.verify_at(code, now_unix())
    }

    fn code_for_step(&self, step: u64) -> u32 {
        let tag = hmac::sign(&self.key, &step.to_be_bytes());
        let digest = tag.as_ref();
        // RFC 4226 dynamic truncation
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ])
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
