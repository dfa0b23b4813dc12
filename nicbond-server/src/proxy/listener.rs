use crate::policy::Action;
use crate::proxy::handler::serve_tls;
use crate::proxy::http1::{H1Conn, ParsedRequest, Rewind};
use crate::tls::sni::extract_sni;
use crate::Core;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const SNI_SNIFF_WINDOW: Duration = Duration::from_secs(2);

/// Run the proxy listener until shutdown. `ready` fires once the socket is
/// bound.
pub async fn run(core: Arc<Core>, ready: tokio::sync::oneshot::Sender<()>) -> Result<()> {
    let listener = TcpListener::bind(core.config.listen_addr)
        .await
        .with_context(|| format!("failed to bind proxy on {}", core.config.listen_addr))?;
    info!("proxy listening on {}", core.config.listen_addr);
    let _ = ready.send(());

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = result.context("failed to accept connection")?;
                let core = core.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(core, stream, addr).await {
                        debug!("connection from {addr} ended: {e:#}");
                    }
                });
            }
            _ = core.shutdown.cancelled() => {
                info!("proxy listener received shutdown signal");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(core: Arc<Core>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let mut conn = H1Conn::new(stream);
    let Some(req) = conn.read_request().await.context("failed to read first request")? else {
        return Ok(());
    };

    if req.is_connect() {
        handle_connect(core, conn, &req).await
    } else {
        handle_plain(conn, &req, addr).await
    }
}

async fn handle_connect(
    core: Arc<Core>,
    mut conn: H1Conn<TcpStream>,
    req: &ParsedRequest,
) -> Result<()> {
    let (host, port) = split_host_port(&req.target, 443);

    conn.stream_mut()
        .write_all(ESTABLISHED)
        .await
        .context("failed to confirm CONNECT")?;
    conn.stream_mut().flush().await.context("failed to confirm CONNECT")?;

    let action = core.policy.check(&host);
    if action == Action::Accelerate && port == 443 {
        let (stream, leftover) = conn.into_parts();

        let sni = tokio::time::timeout(SNI_SNIFF_WINDOW, sniff_sni(&stream, &leftover))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| host.clone());

        let tls_config = match core.forge.get_or_forge(&sni).await {
            Ok(config) => config,
            Err(e) => {
                // The handshake simply never happens; the client sees a TLS
                // failure and can retry or bypass.
                warn!("certificate forgery for {sni} failed: {e:#}");
                return Ok(());
            }
        };

        let acceptor = TlsAcceptor::from(tls_config);
        let tls = acceptor
            .accept(Rewind::new(leftover, stream))
            .await
            .with_context(|| format!("TLS handshake with client for {sni} failed"))?;

        serve_tls(core, tls, &host).await;
        return Ok(());
    }

    // PassThrough and Isolate tunnel the bytes untouched.
    splice_to(conn, &host, port).await
}

async fn handle_plain(
    conn: H1Conn<TcpStream>,
    req: &ParsedRequest,
    addr: SocketAddr,
) -> Result<()> {
    let authority = if let Some(rest) = req.target.strip_prefix("http://") {
        rest.split('/').next().unwrap_or("").to_string()
    } else {
        req.header("host").unwrap_or("").to_string()
    };
    if authority.is_empty() {
        bail!("plain request from {addr} carries no host");
    }
    let (host, port) = split_host_port(&authority, 80);

    // The request head was consumed while parsing, so it is replayed ahead
    // of the raw splice.
    let mut head = req.serialize_head();
    head.extend_from_slice(&req.body);
    splice_with_replay(conn, &host, port, head).await
}

async fn splice_to(conn: H1Conn<TcpStream>, host: &str, port: u16) -> Result<()> {
    splice_with_replay(conn, host, port, Vec::new()).await
}

async fn splice_with_replay(
    conn: H1Conn<TcpStream>,
    host: &str,
    port: u16,
    replay: Vec<u8>,
) -> Result<()> {
    let mut upstream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to reach {host}:{port}"))?;

    let (stream, leftover) = conn.into_parts();
    if !replay.is_empty() {
        upstream
            .write_all(&replay)
            .await
            .context("failed to replay request head upstream")?;
    }
    if !leftover.is_empty() {
        upstream
            .write_all(&leftover)
            .await
            .context("failed to forward buffered bytes upstream")?;
    }

    let mut client = stream;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Wait for the ClientHello to show up on the socket and read its SNI. The
/// bytes stay queued for the TLS acceptor; only `peek` is used.
async fn sniff_sni(stream: &TcpStream, leftover: &[u8]) -> Option<String> {
    if !leftover.is_empty() {
        return extract_sni(leftover);
    }

    let mut buf = vec![0u8; 8192];
    let mut last_len = 0usize;
    let mut stalls = 0u32;
    loop {
        let n = stream.peek(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        if let Some(sni) = extract_sni(&buf[..n]) {
            return Some(sni);
        }
        if n == last_len {
            stalls += 1;
            if stalls > 3 || n == buf.len() {
                return None;
            }
        } else {
            stalls = 0;
            last_len = n;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (authority.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            split_host_port("dl.example.com:8443", 443),
            ("dl.example.com".to_string(), 8443)
        );
        assert_eq!(
            split_host_port("dl.example.com", 443),
            ("dl.example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:443", 443),
            ("2001:db8::1".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]", 443),
            ("2001:db8::1".to_string(), 443)
        );
    }
}
