//! Probes over real sockets
//!
//! Downloads go through `reqwest` with redirects disabled and the target
//! pinned to a chosen address, so a poisoned resolver can be sidestepped.
//! ClientHello, HTTP and QUIC probes use plain Tokio sockets.

use crate::error::{DiscoveryError, Result};
use crate::model::{FailureMode, ProbeOutcome};
use crate::network::{HelloOutcome, HelloRequest, HttpOutcome, Network, ProbeRequest};
use async_trait::async_trait;
use desync_core::tls::ClientHelloBuilder;
use reqwest::header::{ACCEPT, LOCATION, USER_AGENT};
use reqwest::redirect::Policy;
use serde_json::Value;
use socket2::SockRef;
use std::error::Error as _;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

const PROBE_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// QUIC version reserved for negotiation; servers answer with a
/// Version Negotiation packet
const NEGOTIATION_VERSION: u32 = 0x1a2a_3a4a;

/// Network probes using the host's sockets
#[derive(Debug, Clone)]
pub struct LiveNetwork {
    doh_url: String,
    doh: reqwest::Client,
}

impl LiveNetwork {
    /// Create a prober resolving DNS-over-HTTPS through `doh_url`
    pub fn new(doh_url: impl Into<String>) -> Result<Self> {
        let doh = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;
        Ok(Self {
            doh_url: doh_url.into(),
            doh,
        })
    }

    fn download_client(request: &ProbeRequest) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(request.timeout)
            .pool_max_idle_per_host(0);
        if let Some(addr) = request.addr {
            builder = builder.resolve(&request.host, SocketAddr::new(addr, 443));
        }
        builder.build()
    }
}

/// Map a reqwest failure onto a failure mode by walking its source chain
fn classify_error(err: &reqwest::Error) -> FailureMode {
    if err.is_timeout() {
        return FailureMode::Timeout;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return FailureMode::Reset
                }
                io::ErrorKind::ConnectionRefused => return FailureMode::ConnectFailed,
                io::ErrorKind::TimedOut => return FailureMode::Timeout,
                _ => {}
            }
        }
        let text = inner.to_string().to_ascii_lowercase();
        if text.contains("alert") {
            return FailureMode::TlsAlert;
        }
        if text.contains("reset") {
            return FailureMode::Reset;
        }
        if text.contains("dns error") || text.contains("failed to lookup") {
            return FailureMode::Dns;
        }
        source = inner.source();
    }
    if err.is_connect() {
        FailureMode::ConnectFailed
    } else {
        FailureMode::Other
    }
}

/// Whether a `Location` value leaves `host`
fn redirects_away(location: &str, host: &str) -> bool {
    let Some(rest) = location
        .strip_prefix("https://")
        .or_else(|| location.strip_prefix("http://"))
    else {
        // Relative redirects stay on the same host
        return false;
    };
    let target = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    target != host && !target.ends_with(&format!(".{host}")) && !host.ends_with(&format!(".{target}"))
}

/// Status code and `Location` from an HTTP/1.x response head
fn parse_http_head(head: &[u8]) -> Option<(u16, Option<String>)> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let status = lines.next()?;
    let mut parts = status.split_whitespace();
    if !parts.next()?.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?.parse().ok()?;
    let location = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("location"))
        .map(|(_, value)| value.trim().to_string());
    Some((code, location))
}

/// A and AAAA records from a JSON DoH answer
fn parse_doh_answer(body: &Value) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for record in body["Answer"].as_array().into_iter().flatten() {
        let record_type = record["type"].as_u64().unwrap_or_default();
        if record_type != 1 && record_type != 28 {
            continue;
        }
        if let Some(addr) = record["data"].as_str().and_then(|d| d.parse().ok()) {
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    out
}

/// Long-header QUIC datagram with a reserved version, padded to 1200 bytes
fn negotiation_probe() -> Vec<u8> {
    let mut datagram = Vec::with_capacity(1200);
    datagram.push(0xc0);
    datagram.extend_from_slice(&NEGOTIATION_VERSION.to_be_bytes());
    datagram.push(8);
    datagram.extend_from_slice(&uuid::Uuid::new_v4().as_bytes()[..8]);
    datagram.push(0);
    datagram.resize(1200, 0);
    datagram
}

fn set_hop_limit(stream: &TcpStream, addr: IpAddr, ttl: u8) -> io::Result<()> {
    let sock = SockRef::from(stream);
    match addr {
        IpAddr::V4(_) => sock.set_ttl(u32::from(ttl)),
        IpAddr::V6(_) => sock.set_unicast_hops_v6(u32::from(ttl)),
    }
}

#[async_trait]
impl Network for LiveNetwork {
    async fn download(&self, request: &ProbeRequest) -> ProbeOutcome {
        let start = Instant::now();
        let client = match Self::download_client(request) {
            Ok(client) => client,
            Err(e) => {
                debug!(error = %e, "probe client setup failed");
                return ProbeOutcome::failure(FailureMode::Other, start.elapsed());
            }
        };
        let url = format!("https://{}{}", request.host, request.path);

        let transfer = async {
            let mut response = client
                .get(&url)
                .header(USER_AGENT, PROBE_USER_AGENT)
                .send()
                .await
                .map_err(|e| (classify_error(&e), None))?;
            let status = response.status().as_u16();

            if response.status().is_redirection() {
                let away = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map_or(true, |location| redirects_away(location, &request.host));
                if away {
                    return Err((FailureMode::Redirect, Some(status)));
                }
            }
            if status == 403 || status == 451 {
                return Err((FailureMode::BlockPage, Some(status)));
            }

            let mut bytes = 0u64;
            loop {
                match timeout(request.stall_timeout, response.chunk()).await {
                    Err(_) => return Err((FailureMode::Stall, Some(status))),
                    Ok(Err(e)) => return Err((classify_error(&e), Some(status))),
                    Ok(Ok(None)) => break,
                    Ok(Ok(Some(chunk))) => {
                        bytes += chunk.len() as u64;
                        if bytes >= request.max_bytes {
                            break;
                        }
                    }
                }
            }
            Ok::<_, (FailureMode, Option<u16>)>((bytes, status))
        };

        let outcome = match timeout(request.timeout, transfer).await {
            Err(_) => ProbeOutcome::failure(FailureMode::Timeout, start.elapsed()),
            Ok(Ok((bytes, status))) => ProbeOutcome::success(bytes, start.elapsed(), status),
            Ok(Err((mode, status))) => {
                let outcome = ProbeOutcome::failure(mode, start.elapsed());
                status.map_or(outcome, |s| outcome.with_status(s))
            }
        };
        trace!(host = %request.host, ?outcome, "download probe");
        outcome
    }

    async fn hello(&self, request: &HelloRequest) -> HelloOutcome {
        let addr = SocketAddr::new(request.addr, 443);
        let mut stream = match timeout(request.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            _ => return HelloOutcome::Unreachable,
        };
        // Applied after the handshake so the SYN still reaches the server
        if let Some(ttl) = request.ttl {
            if let Err(e) = set_hop_limit(&stream, request.addr, ttl) {
                debug!(error = %e, "setting probe TTL failed");
                return HelloOutcome::Unreachable;
            }
        }

        let hello = match &request.sni {
            Some(host) => ClientHelloBuilder::new(host.as_str()),
            None => ClientHelloBuilder::without_sni(),
        }
        .randomized()
        .build_record();

        let start = Instant::now();
        if let Err(e) = stream.write_all(&hello).await {
            return match e.kind() {
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => HelloOutcome::Reset {
                    after: start.elapsed(),
                    ttl: None,
                },
                _ => HelloOutcome::Unreachable,
            };
        }

        let mut buf = [0u8; 512];
        match timeout(request.timeout, stream.read(&mut buf)).await {
            Err(_) => HelloOutcome::Timeout,
            Ok(Ok(0)) => HelloOutcome::Closed,
            Ok(Ok(_)) => HelloOutcome::Response {
                after: start.elapsed(),
            },
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => HelloOutcome::Reset {
                after: start.elapsed(),
                ttl: None,
            },
            Ok(Err(_)) => HelloOutcome::Closed,
        }
    }

    async fn http_host(&self, addr: IpAddr, host: &str, deadline: Duration) -> HttpOutcome {
        let exchange = async {
            let mut stream = TcpStream::connect(SocketAddr::new(addr, 80))
                .await
                .map_err(|_| HttpOutcome::Unreachable)?;
            let request = format!(
                "GET / HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {PROBE_USER_AGENT}\r\nConnection: close\r\n\r\n"
            );
            stream
                .write_all(request.as_bytes())
                .await
                .map_err(|_| HttpOutcome::Reset)?;

            let mut head = Vec::with_capacity(1024);
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < 16 * 1024 {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        return Err(HttpOutcome::Reset)
                    }
                    Err(_) => break,
                }
            }
            match parse_http_head(&head) {
                Some((code, location)) => Ok::<_, HttpOutcome>(HttpOutcome::Status { code, location }),
                None if head.is_empty() => Err(HttpOutcome::Reset),
                None => Err(HttpOutcome::Timeout),
            }
        };
        match timeout(deadline, exchange).await {
            Err(_) => HttpOutcome::Timeout,
            Ok(Ok(outcome) | Err(outcome)) => outcome,
        }
    }

    async fn quic(&self, addr: SocketAddr, deadline: Duration) -> bool {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let Ok(socket) = UdpSocket::bind(local).await else {
            return false;
        };
        if socket.send_to(&negotiation_probe(), addr).await.is_err() {
            return false;
        }
        let mut buf = [0u8; 1500];
        matches!(timeout(deadline, socket.recv_from(&mut buf)).await, Ok(Ok(_)))
    }

    async fn resolve_system(&self, host: &str) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = Vec::new();
        match tokio::net::lookup_host((host, 443)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if !out.contains(&addr.ip()) {
                        out.push(addr.ip());
                    }
                }
            }
            Err(e) => debug!(host, error = %e, "system resolver failed"),
        }
        out
    }

    async fn resolve_doh(&self, host: &str) -> Vec<IpAddr> {
        let response = self
            .doh
            .get(&self.doh_url)
            .query(&[("name", host), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await;
        match response {
            Ok(response) => match response.json::<Value>().await {
                Ok(body) => parse_doh_answer(&body),
                Err(e) => {
                    debug!(host, error = %e, "DoH answer unreadable");
                    Vec::new()
                }
            },
            Err(e) => {
                debug!(host, error = %e, "DoH query failed");
                Vec::new()
            }
        }
    }
}
