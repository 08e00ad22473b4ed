//! Local DNS relay.
//!
//! Binds a resolver-style UDP listener and carries each incoming query
//! through the tunnel: the raw wire-format message is wrapped in
//! DNS-over-TCP length framing and written into a fresh relay-mode
//! connection; the framed reply comes back the same way and is returned to
//! the local client. The responder decides which upstream resolver actually
//! answers.

use crate::dns::message::frame_tcp;
use crate::handshake::TunnelMode;
use crate::initiator::Initiator;
use crate::tc::TransmissionControl;
use crate::TunnelError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

pub struct DnsRelay {
    socket: Arc<UdpSocket>,
    initiator: Arc<Initiator>,
}

impl DnsRelay {
    pub async fn bind(listen: SocketAddr, initiator: Arc<Initiator>) -> Result<DnsRelay, TunnelError> {
        let socket = UdpSocket::bind(listen).await?;
        log::info!("DNS relay listening on {listen}");
        Ok(DnsRelay {
            socket: Arc::new(socket),
            initiator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) -> Result<(), TunnelError> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let query = buf[..n].to_vec();
            let socket = Arc::clone(&self.socket);
            let initiator = Arc::clone(&self.initiator);
            tokio::spawn(async move {
                match relay_one(&initiator, &query).await {
                    Ok(reply) => {
                        if let Err(e) = socket.send_to(&reply, from).await {
                            log::debug!("relay reply to {from} failed: {e}");
                        }
                    }
                    Err(e) => log::debug!("relay lookup for {from} failed: {e}"),
                }
            });
        }
    }
}

/// One query, one connection: write the framed query, read the framed reply.
async fn relay_one(initiator: &Arc<Initiator>, query: &[u8]) -> Result<Vec<u8>, TunnelError> {
    let tc = initiator.open("", 0, TunnelMode::DnsRelay).await?;
    let result = exchange_framed(&tc, query).await;
    tc.close();
    result
}

async fn exchange_framed(
    tc: &Arc<TransmissionControl>,
    query: &[u8],
) -> Result<Vec<u8>, TunnelError> {
    tc.write(&frame_tcp(query)).await?;

    let mut len_buf = Vec::with_capacity(2);
    while len_buf.len() < 2 {
        let mut chunk = [0u8; 2];
        let n = tc.read(&mut chunk[..2 - len_buf.len()]).await?;
        if n == 0 {
            return Err(TunnelError::InvalidConfig("relay reply truncated".into()));
        }
        len_buf.extend_from_slice(&chunk[..n]);
    }
    let len = u16::from_be_bytes([len_buf[0], len_buf[1]]) as usize;

    let mut reply = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = tc.read(&mut reply[filled..]).await?;
        if n == 0 {
            return Err(TunnelError::InvalidConfig("relay reply truncated".into()));
        }
        filled += n;
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Carrier;
    use crate::dns::message::{Message, QType, Record};
    use crate::initiator::InitiatorConfig;
    use crate::otp::TotpSecret;
    use crate::responder::{DnsDaemon, ResponderConfig};
    use crate::tc::TcConfig;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

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

    /// Pretend upstream resolver speaking DNS over TCP: answers every query
    /// with a fixed TXT record.
    async fn spawn_upstream_resolver() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut raw = vec![0u8; len];
                    if stream.read_exact(&mut raw).await.is_err() {
                        return;
                    }
                    let query = match Message::parse(&raw) {
                        Ok(query) => query,
                        Err(_) => return,
                    };
                    let reply =
                        Message::answer_to(&query, Record::new_txt(&[b"relayed".to_vec()]));
                    let bytes = match reply.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(_) => return,
                    };
                    let _ = stream.write_all(&frame_tcp(&bytes)).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn plain_lookup_rides_the_tunnel() {
        let upstream = spawn_upstream_resolver().await;

        let responder_cfg = ResponderConfig {
            tc: fast_tc(),
            connect_timeout: Duration::from_secs(2),
            relay_upstream: upstream,
            ..ResponderConfig::new(
                "127.0.0.1:0".parse().unwrap(),
                DOMAIN.to_string(),
                TotpSecret::from_base32(SECRET).unwrap(),
            )
        };
        let daemon = Arc::new(DnsDaemon::bind(responder_cfg).await.unwrap());
        let resolver = daemon.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = daemon.run().await;
        });

        let mut initiator_cfg = InitiatorConfig::new(
            resolver,
            DOMAIN.to_string(),
            TotpSecret::from_base32(SECRET).unwrap(),
        );
        initiator_cfg.carrier = Carrier::Cname;
        initiator_cfg.tc = fast_tc();
        initiator_cfg.query_timeout = Duration::from_secs(2);
        initiator_cfg.handshake_timeout = Duration::from_secs(5);
        let relay = DnsRelay::bind(
            "127.0.0.1:0".parse().unwrap(),
            crate::initiator::Initiator::new(initiator_cfg),
        )
        .await
        .unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = relay.run().await;
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(relay_addr).await.unwrap();
        let query = Message::new_query(0x3131, "www.example.org", QType::Txt);
        client.send(&query.to_bytes().unwrap()).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let n = timeout(Duration::from_secs(10), client.recv(&mut buf))
            .await
            .expect("relay timed out")
            .unwrap();
        let reply = Message::parse(&buf[..n]).unwrap();
        assert_eq!(reply.header.id, 0x3131);
        assert_eq!(
            reply.answers[0].txt_strings().unwrap(),
            vec![b"relayed".to_vec()]
        );
    }
}
