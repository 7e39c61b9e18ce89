//! NFQUEUE interception
//!
//! Thin wrapper around the `nfq` crate. The netlink socket is nonblocking:
//! an empty queue reads as `None` and the worker decides how long to idle.

use crate::error::{PlatformError, Result};
use crate::traits::{PacketQueue, QueueVerdict, QueuedPacket};
use desync_core::packet::Direction;
use nfq::{Message, Queue, Verdict};
use std::io;
use tracing::{info, warn};

/// `NF_INET_LOCAL_OUT`
const HOOK_LOCAL_OUT: u8 = 3;
/// `NF_INET_POST_ROUTING`
const HOOK_POST_ROUTING: u8 = 4;
const ENOBUFS: i32 = 105;

/// Maximum packets the kernel holds for this queue
pub const DEFAULT_QUEUE_LEN: u32 = 4096;

/// One bound NFQUEUE
pub struct NfQueue {
    inner: Queue,
    number: u16,
}

impl std::fmt::Debug for NfQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfQueue").field("number", &self.number).finish_non_exhaustive()
    }
}

impl NfQueue {
    /// Bind queue `number` in nonblocking mode
    ///
    /// # Errors
    /// Fatal when the netlink socket cannot be opened or bound.
    pub fn open(number: u16) -> Result<Self> {
        let context = |what: &str| format!("nfqueue {number}: {what}");
        let mut inner = Queue::open().map_err(|e| PlatformError::fatal(context("open"), e))?;
        inner.bind(number).map_err(|e| PlatformError::fatal(context("bind"), e))?;
        inner
            .set_queue_max_len(number, DEFAULT_QUEUE_LEN)
            .map_err(|e| PlatformError::fatal(context("queue length"), e))?;
        // Accept rather than drop when the queue overflows
        inner
            .set_fail_open(number, true)
            .map_err(|e| PlatformError::fatal(context("fail-open"), e))?;
        inner.set_nonblocking(true);

        info!(queue = number, "nfqueue bound");
        Ok(Self { inner, number })
    }
}

/// Packet held by an NFQUEUE
pub struct NfPacket {
    message: Message,
    direction: Direction,
}

impl NfPacket {
    fn new(message: Message) -> Self {
        let direction = direction_for_hook(message.get_hook());
        Self { message, direction }
    }
}

/// Packets queued from the output and postrouting hooks leave this host
pub fn direction_for_hook(hook: u8) -> Direction {
    match hook {
        HOOK_LOCAL_OUT | HOOK_POST_ROUTING => Direction::Outbound,
        _ => Direction::Inbound,
    }
}

impl QueuedPacket for NfPacket {
    fn payload(&self) -> &[u8] {
        self.message.get_payload()
    }

    fn direction(&self) -> Direction {
        self.direction
    }
}

impl PacketQueue for NfQueue {
    type Packet = NfPacket;

    fn number(&self) -> u16 {
        self.number
    }

    fn recv(&mut self) -> Result<Option<NfPacket>> {
        match self.inner.recv() {
            Ok(message) => Ok(Some(NfPacket::new(message))),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) if e.raw_os_error() == Some(ENOBUFS) => {
                warn!(queue = self.number, "netlink receive buffer overrun, packets lost");
                Ok(None)
            }
            Err(source) => Err(PlatformError::Queue {
                queue: self.number,
                source,
            }),
        }
    }

    fn verdict(&mut self, packet: NfPacket, verdict: QueueVerdict) -> Result<()> {
        let mut message = packet.message;
        match verdict {
            QueueVerdict::Accept => message.set_verdict(Verdict::Accept),
            QueueVerdict::Drop => message.set_verdict(Verdict::Drop),
            QueueVerdict::Replace(bytes) => {
                message.set_payload(bytes);
                message.set_verdict(Verdict::Accept);
            }
        }
        self.inner.verdict(message).map_err(|source| PlatformError::Queue {
            queue: self.number,
            source,
        })
    }
}
