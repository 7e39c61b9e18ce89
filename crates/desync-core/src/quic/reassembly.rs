//! Per-connection CRYPTO stream reassembly
//!
//! Frames may arrive out of order and across datagrams. Each destination
//! connection ID gets a buffer with an occupancy bitmap; a snapshot is only
//! released once a contiguous run from offset zero holds a complete
//! ClientHello handshake message.

use crate::conntrack::Recency;
use crate::error::{Error, Result};
use crate::tls;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Offsets at or beyond this are treated as hostile and drop the buffer
pub const MAX_CRYPTO_OFFSET: u64 = 1 << 20;

/// Bounds for reassembly state
#[derive(Debug, Clone, Copy)]
pub struct ReassemblyLimits {
    /// Maximum connections tracked at once; the oldest is evicted when full
    pub max_connections: usize,
    /// Bytes kept per connection; data past this is ignored
    pub max_buffer: usize,
    /// Idle time after which a buffer is swept
    pub idle_timeout: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_connections: 512,
            max_buffer: 16 * 1024,
            idle_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct StreamBuffer {
    data: Vec<u8>,
    filled: Vec<u64>,
    contiguous: usize,
    last_seen: Instant,
    stamp: u64,
}

impl StreamBuffer {
    fn new(now: Instant) -> Self {
        Self {
            data: Vec::new(),
            filled: Vec::new(),
            contiguous: 0,
            last_seen: now,
            stamp: 0,
        }
    }

    fn is_set(&self, i: usize) -> bool {
        self.filled.get(i / 64).is_some_and(|w| w & (1 << (i % 64)) != 0)
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
            self.filled.resize(end.div_ceil(64), 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        for i in offset..end {
            self.filled[i / 64] |= 1 << (i % 64);
        }
        while self.contiguous < self.data.len() && self.is_set(self.contiguous) {
            self.contiguous += 1;
        }
    }

    fn complete_prefix(&self) -> Option<&[u8]> {
        let prefix = &self.data[..self.contiguous];
        tls::handshake_complete(prefix).then_some(prefix)
    }
}

/// CRYPTO stream buffers keyed by destination connection ID
#[derive(Debug)]
pub struct CryptoReassembler {
    buffers: HashMap<Vec<u8>, StreamBuffer>,
    recency: Recency<Vec<u8>>,
    limits: ReassemblyLimits,
}

impl CryptoReassembler {
    /// Create an empty reassembler
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            buffers: HashMap::new(),
            recency: Recency::default(),
            limits,
        }
    }

    /// Insert one CRYPTO frame. Returns the contiguous prefix once it holds
    /// a complete ClientHello; the buffer is released at that point.
    pub fn insert(&mut self, dcid: &[u8], offset: u64, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.insert_at(dcid, offset, data, Instant::now())
    }

    /// [`CryptoReassembler::insert`] with an explicit clock
    pub fn insert_at(
        &mut self,
        dcid: &[u8],
        offset: u64,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>> {
        let end = offset.saturating_add(data.len() as u64);
        if offset >= MAX_CRYPTO_OFFSET || end > MAX_CRYPTO_OFFSET {
            self.buffers.remove(dcid);
            return Err(Error::ReassemblyLimit(format!(
                "CRYPTO frame ends at {end}, beyond {MAX_CRYPTO_OFFSET}"
            )));
        }

        if !self.buffers.contains_key(dcid) && self.buffers.len() >= self.limits.max_connections {
            self.evict_oldest();
        }
        let buffer = self
            .buffers
            .entry(dcid.to_vec())
            .or_insert_with(|| StreamBuffer::new(now));
        buffer.last_seen = now;
        buffer.stamp = self.recency.touch(dcid.to_vec());

        // Bounded above by MAX_CRYPTO_OFFSET, so these fit in usize
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let cap = self.limits.max_buffer;
        if offset < cap {
            let take = data.len().min(cap - offset);
            buffer.write(offset, &data[..take]);
        }

        let snapshot = buffer.complete_prefix().map(<[u8]>::to_vec);
        if snapshot.is_some() {
            self.buffers.remove(dcid);
        }
        self.compact();
        Ok(snapshot)
    }

    /// Drop the buffer for `dcid`
    pub fn clear(&mut self, dcid: &[u8]) {
        self.buffers.remove(dcid);
    }

    fn evict_oldest(&mut self) {
        let buffers = &self.buffers;
        let oldest = self
            .recency
            .pop_oldest(|key, stamp| buffers.get(key).is_some_and(|b| b.stamp == stamp));
        if let Some(key) = oldest {
            self.buffers.remove(&key);
        }
    }

    fn compact(&mut self) {
        let buffers = &self.buffers;
        self.recency.compact(buffers.len(), |key, stamp| {
            buffers.get(key).is_some_and(|b| b.stamp == stamp)
        });
    }

    /// Remove buffers idle longer than the timeout; returns how many
    pub fn sweep_at(&mut self, now: Instant) -> usize {
        let before = self.buffers.len();
        let timeout = self.limits.idle_timeout;
        self.buffers
            .retain(|_, b| now.saturating_duration_since(b.last_seen) <= timeout);
        self.compact();
        before - self.buffers.len()
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no connections are tracked
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
