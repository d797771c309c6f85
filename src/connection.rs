//! Per-connection state machine: `CONNECT`/MITM tunnel vs plain-HTTP forward.
//!
//! Grounded on the teacher's `handle_connection` (TLS accept/connect +
//! bidirectional copy), generalized with explicit policy/cache/cert-mint
//! steps and the CONNECT-request parsing style of its sibling binary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::admin;
use crate::error::{ProxyError, Result};
use crate::http_message::{HttpMessageReader, ParsedMessage};
use crate::policy::Decision;
use crate::state::ProxyState;
use crate::traffic::Method;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const FORWARD_CHUNK: usize = 4096;
/// Responses larger than this are forwarded but never buffered for caching.
const TUNNEL_CACHE_CAP: usize = 1024 * 1024;

/// Runs one accepted connection to completion. Failures are logged and
/// contained to this connection; they never propagate to the listener.
pub struct ConnectionHandler {
    state: Arc<ProxyState>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }

    pub async fn run(&self, client: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.handle(client, peer_addr).await {
            match e {
                ProxyError::ClientGone => debug!(%peer_addr, "client gone"),
                ProxyError::Blocked(ref reason) => info!(%peer_addr, %reason, "request blocked"),
                ref other => warn!(%peer_addr, error = %other, "connection handler error"),
            }
        }
    }

    async fn handle(&self, mut client: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let msg = HttpMessageReader::read_request(&mut client)
            .await
            .map_err(|e| ProxyError::ClientProtocolError(e.to_string()))?;

        let method = msg
            .method()
            .ok_or_else(|| ProxyError::ClientProtocolError("missing method".into()))?
            .to_string();

        if method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(client, peer_addr, &msg).await
        } else {
            self.handle_plain(client, peer_addr, method, msg).await
        }
    }

    // ---- CONNECT / MITM -------------------------------------------------

    async fn handle_connect(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        msg: &ParsedMessage,
    ) -> Result<()> {
        let target = msg
            .start_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| ProxyError::ClientProtocolError("missing CONNECT target".into()))?;
        let (host, port) = parse_authority(target, 443);
        let client_ip = Some(peer_addr.ip());

        if let Decision::Block(reason) = self.state.policy.evaluate(&host, client_ip).await {
            write_plain_text(&mut client, 403, &reason).await?;
            return Err(ProxyError::Blocked(reason));
        }

        self.state
            .traffic
            .append(
                Method::Connect,
                format!("{host}:{port}"),
                client_ip.map(|ip| ip.to_string()),
            )
            .await;

        let leaf = self.state.certs.obtain(&host).await?;
        let (certs_der, key_der) = leaf.to_rustls()?;

        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .map_err(ProxyError::from)?;

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs_der, key_der)
            .map_err(|e| ProxyError::CertMintError(e.to_string()))?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let client_tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(client))
            .await
            .map_err(|_| ProxyError::InternalError("client TLS handshake timed out".into()))?
            .map_err(|e| ProxyError::InternalError(format!("client TLS handshake failed: {e}")))?;

        let upstream_tcp = tokio::time::timeout(
            UPSTREAM_CONNECT_TIMEOUT,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| ProxyError::UpstreamConnectError("connect timeout".into()))?
        .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;

        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;
        let connector = TlsConnector::from(self.state.tls_client_config.clone());
        let upstream_tls = tokio::time::timeout(
            UPSTREAM_CONNECT_TIMEOUT,
            connector.connect(server_name, upstream_tcp),
        )
        .await
        .map_err(|_| ProxyError::UpstreamConnectError("tls handshake timeout".into()))?
        .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;

        tunnel(client_tls, upstream_tls).await
    }

    // ---- Plain HTTP forward ----------------------------------------------

    async fn handle_plain(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        method: String,
        msg: ParsedMessage,
    ) -> Result<()> {
        let is_get = method.eq_ignore_ascii_case("GET");
        let path = msg.start_line.split_whitespace().nth(1).unwrap_or("/");

        if is_get && path == "/proxy-admin" {
            let page = admin::render(&self.state).await;
            send_page(&mut client, 200, "text/plain", page.as_bytes(), &[]).await?;
            return Ok(());
        }

        let target = build_target(&msg.start_line, msg.header("host"))?;
        let absolute_url = format!(
            "{}://{}:{}{}",
            target.scheme, target.host, target.port, target.path
        );
        let client_ip = Some(peer_addr.ip());

        if let Decision::Block(reason) = self.state.policy.evaluate(&target.host, client_ip).await
        {
            let body = format!(
                "<html><body><h1>403 Forbidden</h1><p>{reason}</p></body></html>"
            );
            send_page(&mut client, 403, "text/html", body.as_bytes(), &[]).await?;
            return Err(ProxyError::Blocked(reason));
        }

        let traffic_method = Method::parse(&method).unwrap_or(Method::Get);
        self.state
            .traffic
            .append(
                traffic_method,
                absolute_url.clone(),
                client_ip.map(|ip| ip.to_string()),
            )
            .await;

        let user_agent = msg.header("user-agent").map(|s| s.to_string());
        let accept = msg.header("accept").map(|s| s.to_string());

        if is_get {
            if let Some(entry) = self
                .state
                .cache
                .get(&absolute_url, user_agent.as_deref(), accept.as_deref())
                .await
            {
                self.state.cache_stats.record_hit();
                send_page(
                    &mut client,
                    entry.status_code,
                    entry.content_type.as_deref().unwrap_or("application/octet-stream"),
                    &entry.content_bytes(),
                    &[("X-Proxy-Cache", "HIT")],
                )
                .await?;
                return Ok(());
            }
            self.state.cache_stats.record_miss();
        }

        let forward_request =
            build_forward_request(&method, &target.path, &target.host, &msg.headers, &msg.body);

        let tcp = tokio::time::timeout(
            UPSTREAM_CONNECT_TIMEOUT,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| ProxyError::UpstreamConnectError("connect timeout".into()))?
        .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;

        let mut origin: OriginConn = if target.scheme == "https" {
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;
            let connector = TlsConnector::from(self.state.tls_client_config.clone());
            let tls = tokio::time::timeout(
                UPSTREAM_CONNECT_TIMEOUT,
                connector.connect(server_name, tcp),
            )
            .await
            .map_err(|_| ProxyError::UpstreamConnectError("tls handshake timeout".into()))?
            .map_err(|e| ProxyError::UpstreamConnectError(e.to_string()))?;
            OriginConn::Tls(Box::new(tls))
        } else {
            OriginConn::Plain(tcp)
        };

        origin
            .write_all(&forward_request)
            .await
            .map_err(ProxyError::from)?;

        let response = HttpMessageReader::read_response(&mut origin)
            .await
            .map_err(|e| ProxyError::UpstreamProtocolError(e.to_string()))?;

        let status = response.status_code().unwrap_or(502);
        let content_type = response.header("content-type").map(|s| s.to_string());

        if let Some(ct) = &content_type {
            if let Some(reason) = self.state.content_filter.check(ct, &response.body) {
                let body =
                    format!("<html><body><h1>403 Forbidden</h1><p>{reason}</p></body></html>");
                send_page(&mut client, 403, "text/html", body.as_bytes(), &[]).await?;
                return Err(ProxyError::Blocked(reason));
            }
        }

        if is_get && status == 200 {
            let mut headers = response.headers.clone();
            headers.remove("transfer-encoding");
            let _ = self
                .state
                .cache
                .set(
                    &absolute_url,
                    user_agent.as_deref(),
                    accept.as_deref(),
                    status,
                    headers,
                    &response.body,
                    content_type,
                )
                .await;
        }

        relay_response(&mut client, status, &response.headers, &response.body).await?;
        Ok(())
    }
}

// ---- Bidirectional tunnel forwarder ---------------------------------------

/// Runs both tunnel directions as sibling tasks; the first to finish (EOF or
/// error) cancels and joins the other before returning.
async fn tunnel<A, B>(client: A, upstream: B) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = tokio::spawn(async move {
        let mut buf = [0u8; FORWARD_CHUNK];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
        Ok::<(), std::io::Error>(())
    });

    // Accumulates the server->client direction up to a cap so that, in
    // principle, a complete response could be framed for caching; once the
    // cap is exceeded the accumulator is dropped and the bytes are only
    // relayed, never cached (framing inside an opaque tunnel is best-effort).
    let upstream_to_client = tokio::spawn(async move {
        let mut buf = [0u8; FORWARD_CHUNK];
        let mut accumulated = Vec::new();
        let mut accumulating = true;
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if accumulating {
                accumulated.extend_from_slice(&buf[..n]);
                if accumulated.len() > TUNNEL_CACHE_CAP {
                    accumulating = false;
                    accumulated.clear();
                    accumulated.shrink_to_fit();
                }
            }
            client_write.write_all(&buf[..n]).await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut client_to_upstream = client_to_upstream;
    let mut upstream_to_client = upstream_to_client;
    tokio::select! {
        _ = &mut client_to_upstream => {},
        _ = &mut upstream_to_client => {},
    }
    client_to_upstream.abort();
    upstream_to_client.abort();
    let _ = client_to_upstream.await;
    let _ = upstream_to_client.await;
    Ok(())
}

// ---- Origin connection: plain TCP or TLS, behind one type -----------------

enum OriginConn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            OriginConn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            OriginConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            OriginConn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginConn::Plain(s) => Pin::new(s).poll_flush(cx),
            OriginConn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            OriginConn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ---- Request-target parsing -------------------------------------------

struct RequestTarget {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

fn build_target(start_line: &str, host_header: Option<&str>) -> Result<RequestTarget> {
    let target = start_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ProxyError::ClientProtocolError("missing request target".into()))?;

    if let Some(rest) = target.strip_prefix("http://") {
        let (authority, path) = split_authority_path(rest);
        let (host, port) = parse_authority(authority, 80);
        Ok(RequestTarget { scheme: "http".into(), host, port, path })
    } else if let Some(rest) = target.strip_prefix("https://") {
        let (authority, path) = split_authority_path(rest);
        let (host, port) = parse_authority(authority, 443);
        Ok(RequestTarget { scheme: "https".into(), host, port, path })
    } else {
        let host_header = host_header.ok_or_else(|| {
            ProxyError::ClientProtocolError("origin-form request missing Host header".into())
        })?;
        let (host, port) = parse_authority(host_header, 80);
        Ok(RequestTarget {
            scheme: "http".into(),
            host,
            port,
            path: target.to_string(),
        })
    }
}

fn split_authority_path(rest: &str) -> (&str, String) {
    match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    }
}

fn parse_authority(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rfind(':') {
        Some(idx)
            if !authority[idx + 1..].is_empty()
                && authority[idx + 1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            let host = authority[..idx].to_string();
            let port = authority[idx + 1..].parse().unwrap_or(default_port);
            (host, port)
        }
        _ => (authority.to_string(), default_port),
    }
}

// ---- Request/response (de)serialization --------------------------------

fn is_forward_excluded(name: &str) -> bool {
    matches!(
        name,
        "connection" | "proxy-connection" | "proxy-authorization" | "transfer-encoding" | "content-length"
    )
}

fn build_forward_request(
    method: &str,
    path: &str,
    host: &str,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\n").into_bytes();
    let mut wrote_host = false;
    for (name, value) in headers {
        if is_forward_excluded(name) {
            continue;
        }
        if name == "host" {
            wrote_host = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !wrote_host {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}

async fn send_page<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    let mut out = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n",
        status_reason(status),
        body.len()
    );
    for (k, v) in extra_headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("Connection: close\r\n\r\n");
    writer.write_all(out.as_bytes()).await.map_err(ProxyError::from)?;
    writer.write_all(body).await.map_err(ProxyError::from)?;
    Ok(())
}

async fn write_plain_text<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    body: &str,
) -> Result<()> {
    send_page(writer, status, "text/plain", body.as_bytes(), &[]).await
}

async fn relay_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    headers: &HashMap<String, String>,
    body: &[u8],
) -> Result<()> {
    let mut out = format!("HTTP/1.1 {status} {}\r\n", status_reason(status));
    for (name, value) in headers {
        if matches!(name.as_str(), "connection" | "transfer-encoding" | "proxy-connection") {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !headers.contains_key("content-length") {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");
    writer.write_all(out.as_bytes()).await.map_err(ProxyError::from)?;
    writer.write_all(body).await.map_err(ProxyError::from)?;
    Ok(())
}
