//! Query-side DNS transport.
//!
//! Owns the pool of outgoing connections. Every outbound segment a
//! connection produces becomes exactly one DNS query against the configured
//! recursive resolver; every answer yields at most one inbound segment that
//! is routed back to the owning connection. Queries go out over UDP and
//! fall back to TCP when the resolver sets the truncation bit.
//!
//! Answer names are unique per query (the codec appends a nonce label), so
//! resolver caches never short-circuit the tunnel.

use crate::codec::{self, Carrier};
use crate::dns::message::{frame_tcp, Message, QType};
use crate::handshake::{ConfigEcho, TunnelMode, TunnelRequest};
use crate::otp::TotpSecret;
use crate::segment::Segment;
use crate::tc::{TcConfig, TransmissionControl};
use crate::TunnelError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;

pub struct InitiatorConfig {
    /// Recursive resolver the queries are sent to.
    pub resolver: SocketAddr,
    /// Authoritative domain of the tunnel.
    pub domain: String,
    pub carrier: Carrier,
    pub otp: TotpSecret,
    pub tc: TcConfig,
    /// Override for the per-query payload size.
    pub upstream_seg_len: Option<usize>,
    /// Override for the per-answer payload size.
    pub downstream_seg_len: Option<usize>,
    pub query_timeout: Duration,
    /// Concurrent outstanding queries per connection.
    pub max_in_flight: usize,
    pub handshake_timeout: Duration,
}

impl InitiatorConfig {
    pub fn new(resolver: SocketAddr, domain: String, otp: TotpSecret) -> InitiatorConfig {
        InitiatorConfig {
            resolver,
            domain,
            carrier: Carrier::Cname,
            otp,
            tc: TcConfig::default(),
            upstream_seg_len: None,
            downstream_seg_len: None,
            query_timeout: Duration::from_secs(5),
            max_in_flight: 4,
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

/// Active-open endpoint: one per process, many connections.
pub struct Initiator {
    cfg: Arc<InitiatorConfig>,
    directory: Arc<RwLock<HashMap<u16, Arc<TransmissionControl>>>>,
}

impl Initiator {
    pub fn new(cfg: InitiatorConfig) -> Arc<Initiator> {
        Arc::new(Initiator {
            cfg: Arc::new(cfg),
            directory: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn domain(&self) -> &str {
        &self.cfg.domain
    }

    /// Payload bytes each query can carry under the configured domain.
    pub fn upstream_capacity(&self) -> usize {
        let cap = codec::max_label_payload(&self.cfg.domain);
        match self.cfg.upstream_seg_len {
            Some(n) => n.min(cap),
            None => cap,
        }
    }

    /// Payload bytes each answer can carry for the configured carrier.
    pub fn downstream_capacity(&self) -> usize {
        let cap = codec::max_answer_payload(self.cfg.carrier, &self.cfg.domain);
        match self.cfg.downstream_seg_len {
            Some(n) => n.min(cap),
            None => cap,
        }
    }

    pub async fn lookup(&self, id: u16) -> Option<Arc<TransmissionControl>> {
        self.directory.read().await.get(&id).cloned()
    }

    pub async fn active_connections(&self) -> usize {
        self.directory.read().await.len()
    }

    /// Opens a tunnelled connection toward `host:port`, blocking until the
    /// responder has accepted it or the handshake times out.
    pub async fn open(
        &self,
        host: &str,
        port: u16,
        mode: TunnelMode,
    ) -> Result<Arc<TransmissionControl>, TunnelError> {
        let upstream = self.upstream_capacity();
        let downstream = self.downstream_capacity();
        if upstream == 0 {
            return Err(TunnelError::InvalidConfig(format!(
                "domain {} leaves no room for payload",
                self.cfg.domain
            )));
        }

        let request = TunnelRequest {
            otp: self.cfg.otp.current(),
            mode,
            upstream_seg_len: upstream.min(u16::MAX as usize) as u16,
            downstream_seg_len: downstream.min(u16::MAX as usize) as u16,
            port,
            host: host.to_string(),
        };
        let payload = request.encode()?;

        let id = self.reserve_id().await;
        let mut tc_cfg = self.cfg.tc.clone();
        tc_cfg.max_segment_len = upstream;
        let tc = TransmissionControl::initiate(id, tc_cfg, payload);
        self.directory.write().await.insert(id, Arc::clone(&tc));

        tokio::spawn(Self::query_loop(
            Arc::clone(&self.cfg),
            Arc::clone(&self.directory),
            Arc::clone(&tc),
        ));

        match tc.wait_established(self.cfg.handshake_timeout).await {
            Ok(()) => {
                if let Some(raw) = tc.take_syn_ack_payload() {
                    match ConfigEcho::decode(&raw) {
                        Ok(echo) => {
                            log::debug!(
                                "tunnel {id:04x}: granted up={} down={}",
                                echo.upstream_seg_len,
                                echo.downstream_seg_len
                            );
                            tc.set_max_segment_len(echo.upstream_seg_len as usize);
                        }
                        Err(e) => log::debug!("tunnel {id:04x}: unreadable config echo: {e}"),
                    }
                }
                Ok(tc)
            }
            Err(e) => {
                self.directory.write().await.remove(&id);
                tc.close();
                Err(e.into())
            }
        }
    }

    async fn reserve_id(&self) -> u16 {
        let directory = self.directory.read().await;
        loop {
            let id = rand::random::<u16>();
            if !directory.contains_key(&id) {
                return id;
            }
        }
    }

    /// Turns each outbound segment into one query and feeds decoded answers
    /// back. Runs until the connection's pump shuts down.
    async fn query_loop(
        cfg: Arc<InitiatorConfig>,
        directory: Arc<RwLock<HashMap<u16, Arc<TransmissionControl>>>>,
        tc: Arc<TransmissionControl>,
    ) {
        let in_flight = Arc::new(Semaphore::new(cfg.max_in_flight.max(1)));
        while let Some(seg) = tc.outbound_recv().await {
            let permit = match Arc::clone(&in_flight).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let cfg = Arc::clone(&cfg);
            let tc = Arc::clone(&tc);
            tokio::spawn(async move {
                let _permit = permit;
                match exchange(&cfg, &seg).await {
                    Ok(Some(answer)) if answer.id == tc.id() => tc.handle_segment(answer),
                    Ok(Some(answer)) => {
                        log::debug!("answer for foreign connection {:04x}", answer.id)
                    }
                    Ok(None) => {} // NODATA; retransmission recovers
                    Err(e) => log::debug!("query for {:04x} failed: {e}", tc.id()),
                }
            });
        }
        directory.write().await.remove(&tc.id());
        log::debug!("tunnel {:04x}: query loop finished", tc.id());
    }
}

/// One full query/answer exchange.
async fn exchange(cfg: &InitiatorConfig, seg: &Segment) -> Result<Option<Segment>, TunnelError> {
    let qname = codec::encode_labels(seg, &cfg.domain)?;
    let qtype = match cfg.carrier {
        Carrier::Cname => QType::Cname,
        Carrier::Txt => QType::Txt,
    };
    let query = Message::new_query(rand::random::<u16>(), &qname, qtype);
    let raw_query = query.to_bytes()?;

    let (reply, raw_reply) = match udp_exchange(cfg, &raw_query, query.header.id).await? {
        Some(pair) => pair,
        None => return Ok(None),
    };

    let (reply, raw_reply) = if reply.header.is_truncated() {
        tcp_exchange(cfg, &raw_query).await?
    } else {
        (reply, raw_reply)
    };

    decode_answer(cfg, &reply, &raw_reply)
}

async fn udp_exchange(
    cfg: &InitiatorConfig,
    raw_query: &[u8],
    query_id: u16,
) -> Result<Option<(Message, Vec<u8>)>, TunnelError> {
    // Loopback resolvers need a loopback source address.
    let bind_addr: SocketAddr = if cfg.resolver.is_ipv4() {
        if cfg.resolver.ip().is_loopback() {
            "127.0.0.1:0"
        } else {
            "0.0.0.0:0"
        }
    } else if cfg.resolver.ip().is_loopback() {
        "[::1]:0"
    } else {
        "[::]:0"
    }
    .parse()
    .map_err(|e| TunnelError::InvalidConfig(format!("bind address: {e}")))?;

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(cfg.resolver).await?;
    socket.send(raw_query).await?;

    let mut buf = vec![0u8; 4096];
    let n = match timeout(cfg.query_timeout, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(TunnelError::QueryTimeout),
    };
    let raw = buf[..n].to_vec();
    let msg = Message::parse(&raw)?;
    if msg.header.id != query_id || !msg.header.is_response() {
        return Ok(None);
    }
    Ok(Some((msg, raw)))
}

async fn tcp_exchange(
    cfg: &InitiatorConfig,
    raw_query: &[u8],
) -> Result<(Message, Vec<u8>), TunnelError> {
    let mut stream = match timeout(cfg.query_timeout, TcpStream::connect(cfg.resolver)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(TunnelError::QueryTimeout),
    };
    stream.write_all(&frame_tcp(raw_query)).await?;

    let result = timeout(cfg.query_timeout, async {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut raw = vec![0u8; len];
        stream.read_exact(&mut raw).await?;
        Ok::<Vec<u8>, std::io::Error>(raw)
    })
    .await;
    let raw = match result {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(TunnelError::QueryTimeout),
    };
    let msg = Message::parse(&raw)?;
    Ok((msg, raw))
}

fn decode_answer(
    cfg: &InitiatorConfig,
    reply: &Message,
    raw_reply: &[u8],
) -> Result<Option<Segment>, TunnelError> {
    if reply.header.rcode() != 0 || reply.answers.is_empty() {
        return Ok(None);
    }
    let record = &reply.answers[0];
    let seg = match QType::from_u16(record.rtype) {
        Ok(QType::Txt) => codec::decode_txt(&record.txt_strings()?)?,
        Ok(QType::Cname) => codec::decode_labels(&record.cname_target(raw_reply)?, &cfg.domain)?,
        _ => return Ok(None),
    };
    Ok(Some(seg))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> InitiatorConfig {
        InitiatorConfig::new(
            "127.0.0.1:53535".parse().unwrap(),
            "t.example.com".to_string(),
            TotpSecret::from_base32("JBSWY3DPEHPK3PXP").unwrap(),
        )
    }

    #[test]
    fn capacity_honours_overrides() {
        let mut cfg = test_cfg();
        let unlimited = Initiator::new(test_cfg());
        let natural = unlimited.upstream_capacity();
        assert!(natural > 0);

        cfg.upstream_seg_len = Some(32);
        cfg.downstream_seg_len = Some(10_000);
        let limited = Initiator::new(cfg);
        assert_eq!(limited.upstream_capacity(), 32);
        // An oversize override is clamped to what the carrier can hold.
        assert!(limited.downstream_capacity() <= codec::max_answer_payload(Carrier::Cname, "t.example.com"));
    }

    #[test]
    fn txt_carrier_expands_downstream() {
        let mut cfg = test_cfg();
        cfg.carrier = Carrier::Txt;
        let txt = Initiator::new(cfg);
        let cname = Initiator::new(test_cfg());
        assert!(txt.downstream_capacity() >= cname.downstream_capacity() * 4);
    }

    #[tokio::test]
    async fn open_times_out_without_responder() {
        let mut cfg = test_cfg();
        cfg.handshake_timeout = Duration::from_millis(200);
        cfg.query_timeout = Duration::from_millis(50);
        cfg.tc.retransmission_interval = Duration::from_millis(40);
        let initiator = Initiator::new(cfg);
        let err = initiator
            .open("example.test", 80, TunnelMode::Stream)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Transmission(crate::tc::TcError::HandshakeTimeout)
                | TunnelError::Transmission(crate::tc::TcError::ConnectionAborted(_))
        ));
        assert_eq!(initiator.active_connections().await, 0);
    }
}
