//! Authoritative side of the tunnel.
//!
//! The daemon answers every query under the tunnel domain: the QNAME is
//! decoded into a segment, the segment is routed into its connection, and
//! whatever that connection wants to say next rides back in the answer
//! record. If nothing is pending within a short wait the answer is an empty
//! acknowledgement, so the query/answer rhythm never stalls.
//!
//! A SYN for an unknown connection goes through the dispatcher: the OTP is
//! checked, the upstream TCP connection is opened, and only then is the
//! connection admitted to the directory. Failures are answered with a RST
//! carrying the reason.
//!
//! Queries outside the tunnel domain are answered REFUSED; serving real
//! zones is somebody else's job.

use crate::codec::{self, Carrier};
use crate::dns::message::{Message, QType, Record, RCODE_REFUSED};
use crate::handshake::{ConfigEcho, TunnelMode, TunnelRequest};
use crate::otp::TotpSecret;
use crate::segment::{Flags, ResetReason, Segment};
use crate::tc::{TcConfig, TcError, TransmissionControl};
use crate::TunnelError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tokio::time::timeout;

#[derive(Clone)]
pub struct ResponderConfig {
    pub listen: SocketAddr,
    /// Authoritative domain of the tunnel.
    pub domain: String,
    pub otp: TotpSecret,
    pub tc: TcConfig,
    /// Cap on the per-answer payload, below what the carrier permits.
    pub downstream_seg_len: Option<usize>,
    pub connect_timeout: Duration,
    /// Resolver that relay-mode connections are bridged to.
    pub relay_upstream: SocketAddr,
    /// How long terminated connections linger before removal.
    pub linger: Duration,
}

impl ResponderConfig {
    pub fn new(listen: SocketAddr, domain: String, otp: TotpSecret) -> ResponderConfig {
        ResponderConfig {
            listen,
            domain,
            otp,
            tc: TcConfig::default(),
            downstream_seg_len: None,
            connect_timeout: Duration::from_secs(10),
            relay_upstream: "1.1.1.1:53".parse().unwrap_or_else(|_| listen),
            linger: Duration::from_secs(10),
        }
    }
}

/// The DNS daemon registered for the tunnel domain. Serves UDP and TCP on
/// the same address.
pub struct DnsDaemon {
    cfg: Arc<ResponderConfig>,
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    directory: Arc<RwLock<HashMap<u16, Arc<TransmissionControl>>>>,
}

impl DnsDaemon {
    pub async fn bind(cfg: ResponderConfig) -> Result<DnsDaemon, TunnelError> {
        let udp = UdpSocket::bind(cfg.listen).await?;
        let bound = udp.local_addr()?;
        let tcp = TcpListener::bind(bound).await?;
        log::info!("DNS daemon for {} listening on {bound}", cfg.domain);
        Ok(DnsDaemon {
            cfg: Arc::new(cfg),
            udp: Arc::new(udp),
            tcp,
            directory: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.udp.local_addr()?)
    }

    pub async fn active_connections(&self) -> usize {
        self.directory.read().await.len()
    }

    /// Serves queries until the socket fails.
    pub async fn run(self: Arc<Self>) -> Result<(), TunnelError> {
        {
            let daemon = Arc::clone(&self);
            tokio::spawn(async move { daemon.janitor().await });
        }
        {
            let daemon = Arc::clone(&self);
            tokio::spawn(async move { daemon.tcp_loop().await });
        }

        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = self.udp.recv_from(&mut buf).await?;
            let packet = buf[..n].to_vec();
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                if let Some(reply) = daemon.handle_packet(&packet).await {
                    if let Err(e) = daemon.udp.send_to(&reply, from).await {
                        log::debug!("reply to {from} failed: {e}");
                    }
                }
            });
        }
    }

    /// DNS-over-TCP service for clients that retry after truncation.
    async fn tcp_loop(self: Arc<Self>) {
        loop {
            let (mut stream, peer) = match self.tcp.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("TCP accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let daemon = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut packet = vec![0u8; len];
                    if stream.read_exact(&mut packet).await.is_err() {
                        return;
                    }
                    let reply = match daemon.handle_packet(&packet).await {
                        Some(reply) => reply,
                        None => return,
                    };
                    let framed = crate::dns::message::frame_tcp(&reply);
                    if stream.write_all(&framed).await.is_err() {
                        log::debug!("TCP reply to {peer} failed");
                        return;
                    }
                }
            });
        }
    }

    async fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let query = match Message::parse(packet) {
            Ok(query) => query,
            Err(e) => {
                log::debug!("unparseable query: {e}");
                return None;
            }
        };
        if query.header.is_response() {
            return None;
        }
        let qname = query.question_name().ok()?.to_string();
        let qtype = query.questions.first().map(|q| q.qtype)?;

        if !self.name_in_zone(&qname) {
            log::debug!("query for foreign name {qname} refused");
            return Message::refusal(&query, RCODE_REFUSED).to_bytes().ok();
        }

        let seg = match codec::decode_labels(&qname, &self.cfg.domain) {
            Ok(seg) => seg,
            Err(e) => {
                log::debug!("undecodable tunnel query: {e}");
                return None;
            }
        };

        let answer_seg = self.route_segment(seg, qtype).await;
        let record = match self.encode_answer(&answer_seg, qtype) {
            Ok(record) => record,
            Err(e) => {
                log::debug!("answer encode failed: {e}");
                return None;
            }
        };
        Message::answer_to(&query, record).to_bytes().ok()
    }

    fn name_in_zone(&self, qname: &str) -> bool {
        let name = qname.trim_end_matches('.').to_ascii_lowercase();
        let zone = self.cfg.domain.to_ascii_lowercase();
        name == zone || name.ends_with(&format!(".{zone}"))
    }

    fn encode_answer(&self, seg: &Segment, qtype: u16) -> Result<Record, TunnelError> {
        match QType::from_u16(qtype) {
            Ok(QType::Txt) => Ok(Record::new_txt(&codec::encode_txt(seg))),
            _ => {
                let target = codec::encode_labels(seg, &self.cfg.domain)?;
                Ok(Record::new_cname(&target)?)
            }
        }
    }

    /// Feeds one inbound segment to its connection and pulls the reply
    /// segment for the answer.
    async fn route_segment(&self, seg: Segment, qtype: u16) -> Segment {
        let id = seg.id;
        let existing = self.directory.read().await.get(&id).cloned();
        let tc = match existing {
            Some(tc) => tc,
            None => {
                if seg.flags.contains(Flags::SYN) && !seg.flags.contains(Flags::ACK) {
                    match self.accept_syn(&seg, qtype).await {
                        Ok(tc) => tc,
                        Err(reason) => return Segment::rst(id, reason),
                    }
                } else {
                    log::debug!("segment for unknown connection {id:04x}");
                    return Segment::rst(id, ResetReason::UnknownConnection);
                }
            }
        };

        if tc.is_terminated() {
            // Lingering entry: late segments are ignored.
            return tc.ack_segment();
        }
        tc.handle_segment(seg);
        match tc.next_outbound(self.cfg.tc.ack_delay).await {
            Some(seg) => seg,
            None => tc.ack_segment(),
        }
    }

    /// Dispatcher: OTP check, upstream connect, connection admission.
    async fn accept_syn(
        &self,
        syn: &Segment,
        qtype: u16,
    ) -> Result<Arc<TransmissionControl>, ResetReason> {
        let request = match TunnelRequest::decode(&syn.data) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("malformed tunnel request for {:04x}: {e}", syn.id);
                return Err(ResetReason::AuthFailed);
            }
        };
        if !self.cfg.otp.verify(request.otp) {
            log::warn!("tunnel {:04x}: one-time password rejected", syn.id);
            return Err(ResetReason::AuthFailed);
        }

        let carrier = match QType::from_u16(qtype) {
            Ok(QType::Txt) => Carrier::Txt,
            _ => Carrier::Cname,
        };
        let mut down_cap = codec::max_answer_payload(carrier, &self.cfg.domain);
        if let Some(limit) = self.cfg.downstream_seg_len {
            down_cap = down_cap.min(limit);
        }
        let granted_down = down_cap.min(request.downstream_seg_len as usize).max(1);
        let granted_up = codec::max_label_payload(&self.cfg.domain)
            .min(request.upstream_seg_len as usize)
            .max(1);

        let (host, port) = match request.mode {
            TunnelMode::Stream => (request.host.clone(), request.port),
            TunnelMode::DnsRelay => (
                self.cfg.relay_upstream.ip().to_string(),
                self.cfg.relay_upstream.port(),
            ),
        };
        let upstream =
            match timeout(self.cfg.connect_timeout, TcpStream::connect((host.as_str(), port)))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::warn!("tunnel {:04x}: connect {host}:{port} failed: {e}", syn.id);
                    return Err(ResetReason::ConnectFailed);
                }
                Err(_) => {
                    log::warn!("tunnel {:04x}: connect {host}:{port} timed out", syn.id);
                    return Err(ResetReason::ConnectFailed);
                }
            };
        if let Err(e) = upstream.set_nodelay(true) {
            log::debug!("set_nodelay: {e}");
        }

        let echo = ConfigEcho {
            upstream_seg_len: granted_up as u16,
            downstream_seg_len: granted_down as u16,
        };
        let mut tc_cfg = self.cfg.tc.clone();
        tc_cfg.max_segment_len = granted_down;
        let tc =
            TransmissionControl::accept(syn.id, tc_cfg, syn.data.len(), echo.encode());

        // Admission is the single point that writes new entries; a racing
        // duplicate SYN keeps the first connection.
        {
            let mut directory = self.directory.write().await;
            if let Some(existing) = directory.get(&syn.id) {
                tc.close();
                return Ok(Arc::clone(existing));
            }
            directory.insert(syn.id, Arc::clone(&tc));
        }

        log::info!(
            "tunnel {:04x} open: {host}:{port} ({:?}, up {granted_up}, down {granted_down})",
            syn.id,
            request.mode
        );
        bridge(Arc::clone(&tc), upstream);
        Ok(tc)
    }

    /// Sweeps terminated connections out of the directory once their linger
    /// period passes.
    async fn janitor(self: Arc<Self>) {
        let interval = self.cfg.linger.max(Duration::from_millis(100)) / 2;
        loop {
            tokio::time::sleep(interval).await;
            let mut stale = Vec::new();
            {
                let directory = self.directory.read().await;
                for (id, tc) in directory.iter() {
                    if tc.is_terminated() && tc.idle_for() >= self.cfg.linger {
                        stale.push(*id);
                    }
                }
            }
            if stale.is_empty() {
                continue;
            }
            let mut directory = self.directory.write().await;
            for id in stale {
                if let Some(tc) = directory.get(&id) {
                    if tc.is_terminated() {
                        directory.remove(&id);
                        log::debug!("tunnel {id:04x} reaped");
                    }
                }
            }
        }
    }
}

/// Wires a connection to its upstream socket, one task per direction.
fn bridge(tc: Arc<TransmissionControl>, upstream: TcpStream) {
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    {
        let tc = Arc::clone(&tc);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match tc.read(&mut buf).await {
                    Ok(0) => {
                        let _ = upstream_write.shutdown().await;
                        return;
                    }
                    Ok(n) => {
                        if upstream_write.write_all(&buf[..n]).await.is_err() {
                            tc.close();
                            return;
                        }
                    }
                    Err(TcError::ReadTimeout) => continue, // idle is fine
                    Err(_) => {
                        let _ = upstream_write.shutdown().await;
                        return;
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match upstream_read.read(&mut buf).await {
                Ok(0) => {
                    tc.close();
                    return;
                }
                Ok(n) => {
                    if let Err(e) = tc.write(&buf[..n]).await {
                        log::debug!("tunnel {:04x}: write failed: {e}", tc.id());
                        return;
                    }
                }
                Err(_) => {
                    tc.close();
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initiator::{Initiator, InitiatorConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DOMAIN: &str = "t.example.com";
    const SECRET: &str = "JBSWY3DPEHPK3PXP";

    fn fast_tc() -> TcConfig {
        TcConfig {
            max_segment_len: 100,
            retransmission_interval: Duration::from_millis(50),
            sliding_window_wait: Duration::from_millis(20),
            keep_alive_interval: Duration::from_millis(100),
            ack_delay: Duration::from_millis(10),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            max_retransmissions: 100,
            ..TcConfig::default()
        }
    }

    async fn spawn_daemon(secret: &str) -> (Arc<DnsDaemon>, SocketAddr) {
        let cfg = ResponderConfig {
            tc: fast_tc(),
            connect_timeout: Duration::from_secs(2),
            linger: Duration::from_secs(2),
            ..ResponderConfig::new(
                "127.0.0.1:0".parse().unwrap(),
                DOMAIN.to_string(),
                TotpSecret::from_base32(secret).unwrap(),
            )
        };
        let daemon = Arc::new(DnsDaemon::bind(cfg).await.unwrap());
        let addr = daemon.local_addr().unwrap();
        {
            let daemon = Arc::clone(&daemon);
            tokio::spawn(async move {
                let _ = daemon.run().await;
            });
        }
        (daemon, addr)
    }

    fn client(resolver: SocketAddr, secret: &str, carrier: Carrier) -> Arc<Initiator> {
        let mut cfg = InitiatorConfig::new(
            resolver,
            DOMAIN.to_string(),
            TotpSecret::from_base32(secret).unwrap(),
        );
        cfg.carrier = carrier;
        cfg.tc = fast_tc();
        cfg.query_timeout = Duration::from_secs(2);
        cfg.handshake_timeout = Duration::from_secs(5);
        Initiator::new(cfg)
    }

    /// TCP origin that answers each connection with a canned blob after
    /// reading at least one byte, then counts itself.
    async fn spawn_origin(
        response: Vec<u8>,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        {
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => return,
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let response = response.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let _ = stream.write_all(&response).await;
                        let _ = stream.shutdown().await;
                    });
                }
            });
        }
        (addr, accepted)
    }

    async fn read_to_eof(tc: &TransmissionControl) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match tc.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed after {} bytes: {e}", out.len()),
            }
        }
        out
    }

    #[tokio::test]
    async fn request_and_response_cross_the_tunnel() {
        let body: Vec<u8> = (0..2048u32).map(|i| (i % 255) as u8).collect();
        let (origin, accepted) = spawn_origin(body.clone()).await;
        let (_daemon, resolver) = spawn_daemon(SECRET).await;
        let client = client(resolver, SECRET, Carrier::Cname);

        let tc = client
            .open(&origin.ip().to_string(), origin.port(), TunnelMode::Stream)
            .await
            .unwrap();
        tc.write(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();

        let got = read_to_eof(&tc).await;
        assert_eq!(got, body);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        tc.close();
    }

    #[tokio::test]
    async fn txt_carrier_moves_bulk_data() {
        let body: Vec<u8> = (0..100 * 1024u32).map(|i| (i * 7 % 253) as u8).collect();
        let (origin, _accepted) = spawn_origin(body.clone()).await;
        let (_daemon, resolver) = spawn_daemon(SECRET).await;
        let client = client(resolver, SECRET, Carrier::Txt);

        let tc = client
            .open(&origin.ip().to_string(), origin.port(), TunnelMode::Stream)
            .await
            .unwrap();
        tc.write(b"x").await.unwrap();

        let got = read_to_eof(&tc).await;
        assert_eq!(got.len(), body.len());
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn wrong_otp_is_rejected_without_upstream_connect() {
        let (origin, accepted) = spawn_origin(b"nope".to_vec()).await;
        let (_daemon, resolver) = spawn_daemon(SECRET).await;
        // Different secret on the client side.
        let client = client(resolver, "MFRGGZDFMZTWQ2LK", Carrier::Cname);

        let err = client
            .open(&origin.ip().to_string(), origin.port(), TunnelMode::Stream)
            .await
            .unwrap_err();
        match err {
            TunnelError::Transmission(TcError::ConnectionAborted(reason)) => {
                assert_eq!(reason, ResetReason::AuthFailed)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let (_daemon, resolver) = spawn_daemon(SECRET).await;
        let client = client(resolver, SECRET, Carrier::Cname);

        // Port 1 on loopback: nothing listens there.
        let err = client
            .open("127.0.0.1", 1, TunnelMode::Stream)
            .await
            .unwrap_err();
        match err {
            TunnelError::Transmission(TcError::ConnectionAborted(reason)) => {
                assert_eq!(reason, ResetReason::ConnectFailed)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn syn_storm_admits_one_connection() {
        let (origin, accepted) = spawn_origin(b"hi".to_vec()).await;
        let (daemon, resolver) = spawn_daemon(SECRET).await;

        let otp = TotpSecret::from_base32(SECRET).unwrap();
        let request = TunnelRequest {
            otp: otp.current(),
            mode: TunnelMode::Stream,
            upstream_seg_len: 100,
            downstream_seg_len: 100,
            port: origin.port(),
            host: origin.ip().to_string(),
        };
        let syn = Segment::new(
            0x4242,
            0,
            0,
            Flags::SYN,
            request.encode().unwrap(),
        );

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(resolver).await.unwrap();
        for i in 0..10u16 {
            let qname = codec::encode_labels(&syn, DOMAIN).unwrap();
            let query = Message::new_query(i, &qname, QType::Cname);
            socket.send(&query.to_bytes().unwrap()).await.unwrap();
            let mut buf = vec![0u8; 2048];
            let _ = timeout(Duration::from_secs(1), socket.recv(&mut buf)).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(daemon.active_connections().await, 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_connection_answered_with_rst() {
        let (_daemon, resolver) = spawn_daemon(SECRET).await;

        let stray = Segment::new(0x7777, 5, 5, Flags::ACK, b"stray".to_vec());
        let qname = codec::encode_labels(&stray, DOMAIN).unwrap();
        let query = Message::new_query(11, &qname, QType::Cname);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(resolver).await.unwrap();
        socket.send(&query.to_bytes().unwrap()).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::parse(&buf[..n]).unwrap();
        let target = reply.answers[0].cname_target(&buf[..n]).unwrap();
        let seg = codec::decode_labels(&target, DOMAIN).unwrap();
        assert!(seg.flags.contains(Flags::RST));
        assert_eq!(seg.id, 0x7777);
        assert_eq!(
            ResetReason::from_u8(seg.reason),
            ResetReason::UnknownConnection
        );
    }

    #[tokio::test]
    async fn foreign_names_are_refused() {
        let (_daemon, resolver) = spawn_daemon(SECRET).await;
        let query = Message::new_query(3, "www.google.com", QType::A);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(resolver).await.unwrap();
        socket.send(&query.to_bytes().unwrap()).await.unwrap();

        let mut buf = vec![0u8; 512];
        let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = Message::parse(&buf[..n]).unwrap();
        assert_eq!(reply.header.rcode(), RCODE_REFUSED);
    }
}
