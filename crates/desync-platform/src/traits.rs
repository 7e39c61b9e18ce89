//! Platform-agnostic traits for packet interception and injection
//!
//! Workers are generic over these so the verdict and dispatch logic can be
//! driven by in-memory queues and mock sinks in tests.

use crate::Result;
use desync_core::packet::{Direction, Packet};

/// What to tell the kernel about an intercepted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueVerdict {
    /// Release the packet unmodified
    Accept,
    /// Discard the packet
    Drop,
    /// Release the packet with these bytes instead
    Replace(Vec<u8>),
}

/// A packet held by the kernel until it receives a verdict
pub trait QueuedPacket {
    /// Raw IP packet
    fn payload(&self) -> &[u8];

    /// Direction derived from the hook the packet was queued at
    fn direction(&self) -> Direction;
}

/// Interception queue
///
/// Exactly one verdict is issued for every received packet.
pub trait PacketQueue {
    /// Queued packet type
    type Packet: QueuedPacket;

    /// Queue number
    fn number(&self) -> u16;

    /// Wait for the next packet. `Ok(None)` when the read timed out.
    fn recv(&mut self) -> Result<Option<Self::Packet>>;

    /// Issue the verdict for a received packet
    fn verdict(&mut self, packet: Self::Packet, verdict: QueueVerdict) -> Result<()>;
}

/// Raw packet injection
///
/// Implemented by [`RawSender`](crate::RawSender). Failures are returned,
/// never retried.
#[cfg_attr(test, mockall::automock)]
pub trait PacketSink: Send + Sync {
    /// Send a complete IP packet to its destination address
    fn send(&self, packet: &Packet) -> Result<()>;

    /// Send, fragmenting at the IP layer if the packet exceeds `mtu`
    fn send_with_mtu(&self, packet: &Packet, mtu: usize) -> Result<()>;
}

/// Packet captured outside a kernel queue, e.g. from a test harness
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    /// Raw packet data
    pub data: Vec<u8>,
    /// Packet direction
    pub direction: Direction,
}

impl CapturedPacket {
    /// Outbound packet
    pub fn outbound(data: Vec<u8>) -> Self {
        Self {
            data,
            direction: Direction::Outbound,
        }
    }

    /// Inbound packet
    pub fn inbound(data: Vec<u8>) -> Self {
        Self {
            data,
            direction: Direction::Inbound,
        }
    }

    /// Parse the captured packet into a structured Packet
    pub fn parse(&self) -> desync_core::Result<Packet> {
        Packet::from_bytes(&self.data, self.direction)
    }
}

impl QueuedPacket for CapturedPacket {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}
