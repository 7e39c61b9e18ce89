//! Target matching
//!
//! Decides whether a resolved hostname (or a destination address) belongs to
//! one of the configured target sets:
//! - Exact domain matching
//! - Suffix matching (example.com matches sub.example.com)
//! - CIDR matching for destination addresses

mod target_set;

pub use target_set::{normalize_host, TargetMatcher, TargetSet};
