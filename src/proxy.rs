//! HTTP proxy front-end over the tunnel.
//!
//! Listens on a local TCP port and turns each proxy request into one
//! tunnelled connection:
//!
//! - `CONNECT host:port` answers `200 OK` once the responder has reached the
//!   target, then bridges raw bytes (the TLS case).
//! - Absolute-form requests (`GET http://host/path`) open the tunnel to the
//!   origin and forward the request bytes verbatim.
//!
//! Dispatcher-side failures map to 502, timeouts to 504, and a reset tunnel
//! simply closes the client socket.
//!
//! The proxy never owns its connection: once the tunnel is open it keeps
//! only the connection id and goes through the directory
//! ([`Initiator::lookup`]) for every operation, so a torn-down connection
//! disappears out from under the bridge instead of being kept alive by it.

use crate::handshake::TunnelMode;
use crate::initiator::Initiator;
use crate::segment::ResetReason;
use crate::tc::TcError;
use crate::TunnelError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Largest request head the proxy will buffer.
const MAX_HEAD_LEN: usize = 16 * 1024;

pub struct HttpProxy {
    listener: TcpListener,
    initiator: Arc<Initiator>,
}

impl HttpProxy {
    pub async fn bind(
        listen: SocketAddr,
        initiator: Arc<Initiator>,
    ) -> Result<HttpProxy, TunnelError> {
        let listener = TcpListener::bind(listen).await?;
        log::info!("HTTP proxy listening on {listen}");
        Ok(HttpProxy {
            listener,
            initiator,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), TunnelError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let initiator = Arc::clone(&self.initiator);
            tokio::spawn(async move {
                if let Err(e) = handle_client(initiator, stream).await {
                    log::debug!("proxy client {peer}: {e}");
                }
            });
        }
    }
}

async fn handle_client(
    initiator: Arc<Initiator>,
    mut stream: TcpStream,
) -> Result<(), TunnelError> {
    let (head, leftover) = read_head(&mut stream).await?;
    let head_text = String::from_utf8_lossy(&head);
    let request_line = head_text.lines().next().unwrap_or_default().to_string();
    let (method, target) = parse_request_line(&request_line)
        .ok_or_else(|| TunnelError::InvalidConfig(format!("bad request line: {request_line}")))?;

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = match parse_host_port(&target, 443) {
            Some(pair) => pair,
            None => {
                respond(&mut stream, 502, "malformed CONNECT target").await;
                return Ok(());
            }
        };
        log::info!("CONNECT {host}:{port}");
        let id = match initiator.open(&host, port, TunnelMode::Stream).await {
            Ok(tc) => tc.id(),
            Err(e) => {
                respond_open_failure(&mut stream, &e).await;
                return Err(e);
            }
        };
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
        if !leftover.is_empty() {
            tunnel_write(&initiator, id, &leftover).await?;
        }
        bridge_client(initiator, id, stream).await;
    } else {
        let (host, port) = match parse_absolute_target(&target) {
            Some(pair) => pair,
            None => {
                respond(&mut stream, 502, "request target is not an absolute URL").await;
                return Ok(());
            }
        };
        log::info!("{method} {host}:{port}");
        let id = match initiator.open(&host, port, TunnelMode::Stream).await {
            Ok(tc) => tc.id(),
            Err(e) => {
                respond_open_failure(&mut stream, &e).await;
                return Err(e);
            }
        };
        // Forward the request exactly as received.
        tunnel_write(&initiator, id, &head).await?;
        if !leftover.is_empty() {
            tunnel_write(&initiator, id, &leftover).await?;
        }
        bridge_client(initiator, id, stream).await;
    }
    Ok(())
}

/// Writes to a connection found through the directory. The handle is held
/// for this one operation only.
async fn tunnel_write(initiator: &Initiator, id: u16, data: &[u8]) -> Result<(), TunnelError> {
    match initiator.lookup(id).await {
        Some(tc) => {
            tc.write(data).await?;
            Ok(())
        }
        None => Err(TcError::ConnectionAborted(ResetReason::Cancelled).into()),
    }
}

/// Bidirectional copy between the client socket and the tunnel, one task
/// per direction. The connection is re-fetched from the directory for every
/// operation; a vanished entry means the tunnel is gone and the client
/// socket is dropped. Idle read timeouts are not fatal; aborts and EOF are.
async fn bridge_client(initiator: Arc<Initiator>, id: u16, stream: TcpStream) {
    let (mut client_read, mut client_write) = stream.into_split();

    let downstream = {
        let initiator = Arc::clone(&initiator);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let tc = match initiator.lookup(id).await {
                    Some(tc) => tc,
                    None => {
                        let _ = client_write.shutdown().await;
                        return;
                    }
                };
                match tc.read(&mut buf).await {
                    Ok(0) => {
                        let _ = client_write.shutdown().await;
                        return;
                    }
                    Ok(n) => {
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            tc.close();
                            return;
                        }
                    }
                    Err(TcError::ReadTimeout) => continue,
                    Err(_) => {
                        // RST or cancellation: drop the client socket.
                        let _ = client_write.shutdown().await;
                        return;
                    }
                }
            }
        })
    };

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match client_read.read(&mut buf).await {
            Ok(0) => {
                close_tunnel(&initiator, id).await;
                break;
            }
            Ok(n) => {
                let tc = match initiator.lookup(id).await {
                    Some(tc) => tc,
                    None => break,
                };
                if let Err(e) = tc.write(&buf[..n]).await {
                    log::debug!("tunnel {id:04x} write: {e}");
                    break;
                }
            }
            Err(_) => {
                close_tunnel(&initiator, id).await;
                break;
            }
        }
    }
    let _ = downstream.await;
}

async fn close_tunnel(initiator: &Initiator, id: u16) {
    if let Some(tc) = initiator.lookup(id).await {
        tc.close();
    }
}

async fn read_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), TunnelError> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_terminator(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(TunnelError::InvalidConfig("request head too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TunnelError::InvalidConfig(
                "connection closed before request head".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_request_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    Some((method, target))
}

/// `host:port` with a default port; handles bracketed IPv6 literals.
fn parse_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        _ => Some((target.to_string(), default_port)),
    }
}

/// Origin of an absolute-form request target.
fn parse_absolute_target(target: &str) -> Option<(String, u16)> {
    let (default_port, rest) = if let Some(rest) = target.strip_prefix("http://") {
        (80, rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        (443, rest)
    } else {
        return None;
    };
    let authority = rest.split(['/', '?']).next()?;
    if authority.is_empty() {
        return None;
    }
    parse_host_port(authority, default_port)
}

async fn respond_open_failure(stream: &mut TcpStream, err: &TunnelError) {
    match err {
        TunnelError::Transmission(TcError::HandshakeTimeout)
        | TunnelError::Transmission(TcError::ReadTimeout)
        | TunnelError::Transmission(TcError::WriteTimeout)
        | TunnelError::QueryTimeout => {
            respond(stream, 504, "tunnel handshake timed out").await;
        }
        TunnelError::Transmission(TcError::ConnectionAborted(reason)) => {
            respond(stream, 502, &format!("tunnel rejected: {reason}")).await;
        }
        other => {
            respond(stream, 502, &format!("tunnel failed: {other}")).await;
        }
    }
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) {
    let phrase = match status {
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    let payload = format!(
        "HTTP/1.1 {status} {phrase}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(payload.as_bytes()).await {
        log::debug!("error response failed: {e}");
    }
}
