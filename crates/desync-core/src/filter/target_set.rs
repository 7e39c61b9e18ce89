//! Hostname and CIDR target sets
//!
//! Sets are immutable once compiled; a configuration change rebuilds them
//! wholesale.

use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Normalize a hostname for matching: trim, lowercase, strip trailing dots
/// and a leading `*.` wildcard marker
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');
    let host = host.strip_prefix("*.").unwrap_or(host);
    host.to_ascii_lowercase()
}

/// A named group of target hostnames and networks
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    name: String,
    domains: HashSet<String>,
    networks: Vec<IpNetwork>,
}

impl TargetSet {
    /// Create an empty set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a domain. Every domain also covers all of its subdomains.
    pub fn add_domain(&mut self, domain: &str) {
        let domain = normalize_host(domain);
        if domain.is_empty() || domain.starts_with('#') {
            return;
        }
        self.domains.insert(domain);
    }

    /// Add a network in CIDR notation (a bare address is a host route)
    pub fn add_cidr(&mut self, cidr: &str) -> Result<()> {
        let net: IpNetwork = cidr
            .trim()
            .parse()
            .map_err(|e| Error::config_value("cidrs", format!("'{cidr}': {e}")))?;
        self.networks.push(net);
        Ok(())
    }

    /// Load domains from a file
    ///
    /// File format:
    /// - One domain per line
    /// - Lines starting with # are comments
    /// - Empty lines are ignored
    pub fn load_domains_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;

        let mut count = 0;
        for line in content.lines().map(str::trim) {
            if !line.is_empty() && !line.starts_with('#') {
                self.add_domain(line);
                count += 1;
            }
        }

        info!(set = %self.name, count, path = %path.display(), "Loaded target domains");
        Ok(count)
    }

    /// Whether `host` equals a registered domain or has one as a
    /// dot-separated suffix
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        let mut current = host.as_str();
        loop {
            if self.domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    /// Whether `ip` is inside one of the registered networks
    pub fn matches_ip(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(ip))
    }

    /// Whether the set has networks
    pub fn has_networks(&self) -> bool {
        !self.networks.is_empty()
    }

    /// Number of domains plus networks
    pub fn len(&self) -> usize {
        self.domains.len() + self.networks.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.networks.is_empty()
    }
}

/// Ordered list of target sets; the first matching set wins
#[derive(Debug, Clone, Default)]
pub struct TargetMatcher {
    sets: Vec<TargetSet>,
}

impl TargetMatcher {
    /// Build a matcher from sets in priority order
    pub fn new(sets: Vec<TargetSet>) -> Self {
        Self { sets }
    }

    /// Index of the first set matching `host`
    pub fn match_host(&self, host: &str) -> Option<usize> {
        self.sets.iter().position(|s| s.matches_host(host))
    }

    /// Index of the first set whose networks contain `ip`
    pub fn match_ip(&self, ip: IpAddr) -> Option<usize> {
        self.sets.iter().position(|s| s.matches_ip(ip))
    }

    /// Whether any set lists networks
    pub fn has_networks(&self) -> bool {
        self.sets.iter().any(TargetSet::has_networks)
    }

    /// The sets, in priority order
    pub fn sets(&self) -> &[TargetSet] {
        &self.sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn set(domains: &[&str]) -> TargetSet {
        let mut s = TargetSet::new("test");
        for d in domains {
            s.add_domain(d);
        }
        s
    }

    #[test]
    fn test_exact_and_suffix_match() {
        let s = set(&["example.com"]);
        assert!(s.matches_host("example.com"));
        assert!(s.matches_host("www.example.com"));
        assert!(s.matches_host("a.b.example.com"));
        assert!(!s.matches_host("notexample.com"));
        assert!(!s.matches_host("example.com.evil"));
    }

    #[test]
    fn test_case_and_trailing_dot() {
        let s = set(&["Example.COM."]);
        assert!(s.matches_host("WWW.example.com."));
    }

    #[test]
    fn test_wildcard_prefix_accepted() {
        let s = set(&["*.discord.gg"]);
        assert!(s.matches_host("cdn.discord.gg"));
        assert!(s.matches_host("discord.gg"));
    }

    #[test]
    fn test_cidr_match() {
        let mut s = TargetSet::new("nets");
        s.add_cidr("10.0.0.0/8").unwrap();
        s.add_cidr("2001:db8::/32").unwrap();
        assert!(s.matches_ip("10.20.30.40".parse().unwrap()));
        assert!(s.matches_ip("2001:db8::5".parse().unwrap()));
        assert!(!s.matches_ip("192.168.1.1".parse().unwrap()));
        assert!(s.add_cidr("10.0.0.0/99").is_err());
    }

    #[test]
    fn test_matcher_priority() {
        let matcher = TargetMatcher::new(vec![set(&["video.example"]), set(&["example"])]);
        assert_eq!(matcher.match_host("cdn.video.example"), Some(0));
        assert_eq!(matcher.match_host("www.example"), Some(1));
        assert_eq!(matcher.match_host("other.org"), None);
    }

    #[test]
    fn test_load_domains_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\n\nblocked.example\n  spaced.example  ").unwrap();
        let mut s = TargetSet::new("file");
        assert_eq!(s.load_domains_file(file.path()).unwrap(), 2);
        assert!(s.matches_host("spaced.example"));
    }
}
