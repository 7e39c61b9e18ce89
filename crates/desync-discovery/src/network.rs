//! Probe surface used by the controller
//!
//! [`Network`] is the seam between the search logic and the outside world.
//! [`crate::LiveNetwork`] implements it with real sockets; tests drive the
//! controller with a simulated implementation.

use crate::model::ProbeOutcome;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// An HTTPS download to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Hostname used for SNI and the Host header
    pub host: String,
    /// Address to connect to instead of resolving `host`
    pub addr: Option<IpAddr>,
    /// Request path
    pub path: String,
    /// Overall deadline
    pub timeout: Duration,
    /// Longest gap between body chunks
    pub stall_timeout: Duration,
    /// Stop reading after this many body bytes
    pub max_bytes: u64,
}

/// A bare ClientHello exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    /// Server address, port 443
    pub addr: IpAddr,
    /// Hostname for the SNI extension; `None` omits it
    pub sni: Option<String>,
    /// IP TTL for the connection, `None` for the system default
    pub ttl: Option<u8>,
    /// Read deadline
    pub timeout: Duration,
}

/// What came back after a ClientHello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    /// Any bytes from the server
    Response {
        /// Time to first byte
        after: Duration,
    },
    /// Connection reset
    Reset {
        /// Time to the reset
        after: Duration,
        /// IP TTL of the reset, when the platform could observe it
        ttl: Option<u8>,
    },
    /// Orderly close without data
    Closed,
    /// No answer before the deadline
    Timeout,
    /// TCP connect failed
    Unreachable,
}

impl HelloOutcome {
    /// Whether the server answered
    pub fn answered(&self) -> bool {
        matches!(self, HelloOutcome::Response { .. })
    }
}

/// Plain HTTP exchange result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpOutcome {
    /// A status line arrived
    Status {
        /// HTTP status code
        code: u16,
        /// `Location` header, if any
        location: Option<String>,
    },
    /// Connection reset
    Reset,
    /// No answer before the deadline
    Timeout,
    /// TCP connect failed
    Unreachable,
}

/// Network operations the controller needs
#[async_trait]
pub trait Network: Send + Sync {
    /// Download over HTTPS and classify the result
    async fn download(&self, request: &ProbeRequest) -> ProbeOutcome;

    /// Send one ClientHello and report the first reaction
    async fn hello(&self, request: &HelloRequest) -> HelloOutcome;

    /// Plain HTTP GET for `host` on port 80
    async fn http_host(&self, addr: IpAddr, host: &str, timeout: Duration) -> HttpOutcome;

    /// Whether the server reacts to a QUIC datagram on UDP 443
    async fn quic(&self, addr: SocketAddr, timeout: Duration) -> bool;

    /// Addresses from the system resolver
    async fn resolve_system(&self, host: &str) -> Vec<IpAddr>;

    /// Addresses from DNS-over-HTTPS
    async fn resolve_doh(&self, host: &str) -> Vec<IpAddr>;
}
