//! Connection tracking module
//!
//! Provides:
//! - Per-worker TCP flow buffering until a ClientHello is complete
//! - DNS query/response mapping for resolver redirection

mod dns;
mod flow;
mod recency;

pub use dns::{DnsConnTracker, OriginalDestination, QueryKey};
pub use flow::{FlowKey, FlowLimits, FlowTracker, FlowVerdict};
pub(crate) use recency::Recency;
