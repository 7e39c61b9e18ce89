//! DNS redirect tracking
//!
//! When a query is redirected to an alternate resolver, the response has to
//! look as if it came from the server the client asked. Queries are keyed by
//! client port and DNS transaction ID so concurrent lookups from one socket
//! do not collide. The table is shared by every worker.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Key for a redirected query
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct QueryKey {
    /// Client source port
    pub client_port: u16,
    /// DNS transaction ID
    pub txid: u16,
}

/// Where the query was originally headed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalDestination {
    /// Resolver the client addressed
    pub addr: IpAddr,
    /// Port the client addressed
    pub port: u16,
}

#[derive(Debug, Clone, Copy)]
struct QueryInfo {
    original: OriginalDestination,
    created: Instant,
}

/// Thread-safe table of redirected DNS queries
#[derive(Debug)]
pub struct DnsConnTracker {
    queries: DashMap<QueryKey, QueryInfo>,
    timeout: Duration,
}

impl DnsConnTracker {
    /// Create a tracker with the default 5 second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    /// Create with custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            queries: DashMap::new(),
            timeout,
        }
    }

    /// Record a redirected query
    pub fn track_query(&self, key: QueryKey, original: OriginalDestination) {
        self.track_query_at(key, original, Instant::now());
    }

    /// [`DnsConnTracker::track_query`] with an explicit clock
    pub fn track_query_at(&self, key: QueryKey, original: OriginalDestination, now: Instant) {
        self.queries.insert(
            key,
            QueryInfo {
                original,
                created: now,
            },
        );
    }

    /// Take the original destination for a response. The entry is removed;
    /// an expired entry yields `None`.
    pub fn take_original(&self, key: QueryKey) -> Option<OriginalDestination> {
        self.take_original_at(key, Instant::now())
    }

    /// [`DnsConnTracker::take_original`] with an explicit clock
    pub fn take_original_at(&self, key: QueryKey, now: Instant) -> Option<OriginalDestination> {
        let (_, info) = self.queries.remove(&key)?;
        (now.saturating_duration_since(info.created) < self.timeout).then_some(info.original)
    }

    /// Remove expired entries; returns how many
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.queries.len();
        let timeout = self.timeout;
        self.queries
            .retain(|_, info| now.saturating_duration_since(info.created) < timeout);
        before.saturating_sub(self.queries.len())
    }

    /// Number of tracked queries
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether the tracker is empty
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.queries.clear();
    }
}

impl Default for DnsConnTracker {
    fn default() -> Self {
        Self::new()
    }
}
