//! Server configuration.
//!
//! The responder daemon can be driven entirely by flags or loaded from a
//! TOML file; flags win over file values. Durations use humantime strings
//! (`"5s"`, `"400ms"`).

use crate::tc::TcConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

fn default_listen() -> SocketAddr {
    "0.0.0.0:53".parse().expect("static address")
}

fn default_relay_upstream() -> SocketAddr {
    "1.1.1.1:53".parse().expect("static address")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP/TCP address the DNS daemon binds.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Authoritative domain of the tunnel.
    pub dns_name: String,

    /// Shared TOTP secret, base32.
    pub otp_secret: String,

    /// Cap on the per-answer payload size.
    #[serde(default)]
    pub downstream_seg_len: Option<usize>,

    /// Upstream resolver for relay-mode connections.
    #[serde(default = "default_relay_upstream")]
    pub relay_upstream: SocketAddr,

    /// Refuse to (re)start serving; used by the supervisor.
    #[serde(default)]
    pub lockdown: bool,

    #[serde(default)]
    pub timing: TimingConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<ServerConfig> {
        let text = std::fs::read_to_string(path)?;
        let cfg: ServerConfig = toml::from_str(&text)?;
        Ok(cfg)
    }
}

/// Connection timing knobs shared by both endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub retransmission_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sliding_window_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ack_delay: Duration,
    pub max_retransmissions: u32,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
}

impl Default for TimingConfig {
    fn default() -> TimingConfig {
        let tc = TcConfig::default();
        TimingConfig {
            read_timeout: tc.read_timeout,
            write_timeout: tc.write_timeout,
            retransmission_interval: tc.retransmission_interval,
            sliding_window_wait: tc.sliding_window_wait,
            keep_alive_interval: tc.keep_alive_interval,
            ack_delay: tc.ack_delay,
            max_retransmissions: tc.max_retransmissions,
            max_lifetime: tc.max_lifetime,
        }
    }
}

impl TimingConfig {
    pub fn to_tc_config(&self) -> TcConfig {
        TcConfig {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            retransmission_interval: self.retransmission_interval,
            sliding_window_wait: self.sliding_window_wait,
            keep_alive_interval: self.keep_alive_interval,
            ack_delay: self.ack_delay,
            max_retransmissions: self.max_retransmissions,
            max_lifetime: self.max_lifetime,
            ..TcConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg: ServerConfig = toml::from_str(
            r#"
dns_name = "t.example.com"
otp_secret = "JBSWY3DPEHPK3PXP"
"#,
        )
        .unwrap();
        assert_eq!(cfg.listen, default_listen());
        assert_eq!(cfg.relay_upstream, default_relay_upstream());
        assert!(!cfg.lockdown);
        assert_eq!(
            cfg.timing.keep_alive_interval,
            TcConfig::default().keep_alive_interval
        );
    }

    #[test]
    fn timing_round_trips_through_humantime() {
        let cfg: ServerConfig = toml::from_str(
            r#"
listen = "127.0.0.12:5353"
dns_name = "t.example.com"
otp_secret = "JBSWY3DPEHPK3PXP"
downstream_seg_len = 512

[timing]
keep_alive_interval = "2s"
ack_delay = "25ms"
"#,
        )
        .unwrap();
        assert_eq!(cfg.timing.keep_alive_interval, Duration::from_secs(2));
        assert_eq!(cfg.timing.ack_delay, Duration::from_millis(25));
        assert_eq!(cfg.downstream_seg_len, Some(512));
        // Unset knobs stay at their defaults.
        assert_eq!(
            cfg.timing.read_timeout,
            TcConfig::default().read_timeout
        );
        let tc = cfg.timing.to_tc_config();
        assert_eq!(tc.keep_alive_interval, Duration::from_secs(2));
    }
}
