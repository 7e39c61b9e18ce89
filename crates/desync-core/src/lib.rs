//! # desync core
//!
//! Platform-independent engine that replaces the outgoing ClientHello of a
//! targeted TLS or QUIC flow with packets a DPI middlebox cannot follow.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Packet view and checksums** - IPv4/IPv6 TCP/UDP parsing, field
//!   setters and RFC 1071 arithmetic
//! - **Protocol extractors** - TLS ClientHello and QUIC Initial SNI
//!   location, with the layout strategies split against
//! - **Flow tracking** - per-worker ClientHello reassembly and target
//!   matching
//! - **Strategy catalog** - fragmentation, fakes, desync and mutation
//!   producing an ordered send plan
//! - **Configuration** - TOML document, presets per strategy family and a
//!   hot-swappable handle
//!
//! ## Example
//!
//! ```rust,no_run
//! use desync_core::{Config, ConfigHandle, DnsConnTracker, Processor};
//! use desync_core::packet::Direction;
//! use desync_core::pipeline::Decision;
//! use std::sync::Arc;
//!
//! # fn main() -> desync_core::Result<()> {
//! let config = Config::load("desync.toml")?;
//! let handle = Arc::new(ConfigHandle::new(config)?);
//! let mut processor = Processor::new(handle, Arc::new(DnsConnTracker::new()));
//!
//! # let bytes: Vec<u8> = Vec::new();
//! match processor.process(&bytes, Direction::Outbound) {
//!     Decision::Accept => { /* accept verdict */ }
//!     Decision::Rewrite(packet) => { /* accept with packet.as_bytes() */ }
//!     Decision::Replace(plan) => { /* drop verdict, then send the plan */ }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod conntrack;
pub mod error;
pub mod filter;
pub mod packet;
pub mod pipeline;
pub mod quic;
pub mod strategies;
pub mod tls;

// Re-exports for convenience
pub use config::{Config, ConfigHandle, StrategyFamily};
pub use conntrack::{DnsConnTracker, FlowTracker};
pub use error::{Error, Result};
pub use packet::Packet;
pub use pipeline::{Decision, Processor, Stats};
pub use strategies::SendPlan;
