//! desync Platform Layer
//!
//! Packet interception and injection for the desync engine.
//!
//! ## Components
//!
//! - [`NfQueue`]: nonblocking Linux NFQUEUE binding
//! - [`RawSender`]: marked raw IPv4/IPv6 sockets
//! - [`WorkerPool`]: one worker thread per queue number
//! - [`PlanDispatcher`]: ordered, delayed plan delivery on Tokio
//! - [`RuleBuilder`]: the nftables ruleset matching a configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
pub use error::{PlatformError, Result};

mod dispatch;
pub use dispatch::{deliver, DeliveryReport, PlanDispatcher};

mod inject;
pub use inject::{fragment_for_mtu, RawSender};

#[cfg(target_os = "linux")]
mod nfqueue;
#[cfg(target_os = "linux")]
pub use nfqueue::{direction_for_hook, NfPacket, NfQueue};

mod rules;
pub use rules::RuleBuilder;

// Platform-agnostic traits
mod traits;
pub use traits::{CapturedPacket, PacketQueue, PacketSink, QueueVerdict, QueuedPacket};

mod worker;
pub use worker::{Worker, WorkerPool, IDLE_POLL};
