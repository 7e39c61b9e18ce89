//! desync Discovery
//!
//! Finds an evasion configuration that works for a blocked host.
//!
//! ## Components
//!
//! - [`Controller`]: the search for one host, from fingerprint to report
//! - [`DiscoveryManager`]: run registry with ids, progress and cancellation
//! - [`Network`] and [`LiveNetwork`]: the probes a search runs
//! - [`Actuator`]: publishes trial configurations to the packet workers
//!
//! ## Example
//!
//! ```rust,no_run
//! use desync_core::{Config, ConfigHandle};
//! use desync_discovery::{Controller, LiveNetwork};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = Arc::new(ConfigHandle::new(Config::default())?);
//! let network = Arc::new(LiveNetwork::new("https://cloudflare-dns.com/dns-query")?);
//! let report = Controller::new(network, handle).run("blocked.example").await?;
//! println!("{}", report.to_json()?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub use error::{DiscoveryError, Result};

mod actuator;
pub use actuator::{trial_config, Actuator, DISCOVERY_SET};

mod controller;
pub use controller::Controller;

pub mod fingerprint;
pub use fingerprint::{DpiType, Fingerprint};

mod live;
pub use live::LiveNetwork;

mod manager;
pub use manager::{DiscoveryManager, RunInfo, RunStatus};

mod model;
pub use model::{FailureMode, Phase, ProbeOutcome, Progress, TrialResult, TrialStatus};

mod network;
pub use network::{HelloOutcome, HelloRequest, HttpOutcome, Network, ProbeRequest};

mod report;
pub use report::{improvement_pct, DiscoveryReport, DnsReport, Outcome};

pub mod search;
pub use search::Bisection;
