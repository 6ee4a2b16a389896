//! Request forwarding to backend destinations
//!
//! A single pooled HTTP client is shared by every destination; each
//! [`SingleTargetProxy`] only carries the target it rewrites requests to.

use crate::error::{text_error_response, ForwardError, GatewayErrorCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use url::Url;

/// Body type used for every request and response passing through the gateway
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Wrap a complete buffer as a proxy body
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Statistics for forwarded traffic
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Total number of requests forwarded
    pub total_requests: AtomicU64,
    /// Total number of tunnelled upgrades
    pub upgrades: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upgrade(&self) {
        self.upgrades.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_upgrades(&self) -> u64 {
        self.upgrades.load(Ordering::Relaxed)
    }
}

/// Configuration for the backend connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP client shared by all destinations
pub struct Forwarder {
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<ForwardStats>,
}

impl Forwarder {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Forwarding client initialized"
        );

        Self {
            client,
            stats: Arc::new(ForwardStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `target`, keeping the path and query of the original
    pub async fn send(
        &self,
        target: &Url,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let uri = target_uri(target, req.uri())?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        // The pooled client speaks HTTP/1.1 to backends regardless of the client's version
        parts.version = hyper::Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);

        self.stats.record_request();

        let response = self.client.request(Request::from_parts(parts, body)).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Join the target's base path with the request path, preserving the query
fn target_uri(target: &Url, original: &Uri) -> Result<Uri, ForwardError> {
    let base_path = target.path().trim_end_matches('/');
    let path = original.path();
    let joined = if path.starts_with('/') {
        format!("{}{}", base_path, path)
    } else {
        format!("{}/{}", base_path, path)
    };

    let mut uri = format!(
        "{}://{}{}",
        target.scheme(),
        authority(target),
        joined
    );
    if let Some(query) = original.query() {
        uri.push('?');
        uri.push_str(query);
    }

    uri.parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ForwardError::RequestBuild(e.to_string()))
}

/// `host:port` of a target URL, with the scheme's default port filled in
pub fn authority(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port_or_known_default() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Headers that apply to a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Forwarding handler bound to one backend URL
#[derive(Clone)]
pub struct SingleTargetProxy {
    target: Url,
    forwarder: Arc<Forwarder>,
}

impl SingleTargetProxy {
    pub fn new(target: Url, forwarder: Arc<Forwarder>) -> Self {
        Self { target, forwarder }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Forward a request to the target, tunnelling protocol upgrades
    pub async fn serve(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        if is_upgrade_request(&req) {
            return self.serve_upgrade(req).await;
        }

        match self.forwarder.send(&self.target, req).await {
            Ok(response) => response,
            Err(e) => {
                error!(target = %self.target, error = %e, "Failed to forward request");
                text_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                )
            }
        }
    }

    async fn serve_upgrade(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        let backend_addr = authority(&self.target);
        debug!(target = %self.target, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req);

        let mut backend_stream = match TcpStream::connect(&backend_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(backend = %backend_addr, error = %e, "Failed to connect to backend for upgrade");
                return text_error_response(
                    GatewayErrorCode::ConnectionFailed,
                    format!("Failed to connect to backend: {}", e),
                );
            }
        };

        if let Err(e) = backend_stream.write_all(&raw_request).await {
            error!(backend = %backend_addr, error = %e, "Failed to send upgrade request to backend");
            return text_error_response(
                GatewayErrorCode::UpgradeFailed,
                format!("Failed to send upgrade request: {}", e),
            );
        }

        let (head, leftover) = match read_response_head(&mut backend_stream).await {
            Ok(parts) => parts,
            Err(e) => {
                error!(backend = %backend_addr, error = %e, "Failed to read upgrade response from backend");
                return text_error_response(
                    GatewayErrorCode::UpgradeFailed,
                    format!("Failed to read backend response: {}", e),
                );
            }
        };

        let (status, response_headers) = match parse_upgrade_response(&head) {
            Some(parsed) => parsed,
            None => {
                error!(backend = %backend_addr, "Failed to parse backend upgrade response");
                return text_error_response(
                    GatewayErrorCode::UpgradeFailed,
                    "Invalid upgrade response from backend",
                );
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(backend = %backend_addr, status = %status, "Backend rejected upgrade request");
            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(empty_body())
                .unwrap_or_else(|_| text_error_response(GatewayErrorCode::UpgradeFailed, "Invalid backend response"));
        }

        info!(backend = %backend_addr, upgrade_type, "Upgrade successful");
        self.forwarder.stats.record_upgrade();

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }

        let response = match response.body(empty_body()) {
            Ok(response) => response,
            Err(e) => {
                error!(backend = %backend_addr, error = %e, "Invalid upgrade response headers");
                return text_error_response(
                    GatewayErrorCode::UpgradeFailed,
                    "Invalid upgrade response from backend",
                );
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    forward_bidirectional(upgraded, backend_stream, leftover, &backend_addr).await
                }
                Err(e) => error!(backend = %backend_addr, error = %e, "Failed to upgrade client connection"),
            }
        });

        response
    }
}

/// Check if a request asks for a protocol upgrade (e.g. WebSocket)
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    backend_addr: &str,
) {
    let mut client_io = TokioIo::new(client);

    // Bytes the backend sent right behind its 101 head
    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(backend = backend_addr, error = %e, "Upgraded connection closed with error");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                backend = backend_addr,
                client_to_backend,
                backend_to_client = backend_to_client + leftover.len() as u64,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(backend = backend_addr, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Largest response head accepted from a backend during an upgrade
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Read from `stream` until the end of an HTTP response head.
///
/// Returns the head (terminator included) and whatever followed it in the
/// same reads, which already belongs to the upgraded protocol.
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before completing its response",
            ));
        }

        // Resume the search a few bytes back in case the terminator straddles reads
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf[search_from..].windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(search_from + pos + 4);
            return Ok((buf, rest));
        }

        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "backend response head too large",
            ));
        }
    }
}

/// Build the raw HTTP/1.1 upgrade request sent to the backend.
/// The client's Host header is kept so virtual-hosted backends still match.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str("\r\n");
    request.into_bytes()
}

/// Parse the backend's response head to check for 101 Switching Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}
