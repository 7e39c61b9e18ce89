//! Least-recently-touched order for bounded tables
//!
//! Every touch appends `(key, stamp)`; the table stores the latest stamp
//! next to its entry. Entries whose stamp no longer matches are stale and
//! are skipped on eviction, so both touching and evicting are amortized
//! O(1). The queue is compacted once stale entries outnumber live ones.

use std::collections::VecDeque;

/// Extra stale entries tolerated before compacting a small table
const COMPACT_SLACK: usize = 64;

#[derive(Debug)]
pub(crate) struct Recency<K> {
    order: VecDeque<(K, u64)>,
    next: u64,
}

impl<K> Default for Recency<K> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            next: 0,
        }
    }
}

impl<K> Recency<K> {
    /// Record a touch of `key`; the returned stamp must be stored with it
    pub fn touch(&mut self, key: K) -> u64 {
        let stamp = self.next;
        self.next += 1;
        self.order.push_back((key, stamp));
        stamp
    }

    /// Pop the least recently touched key that `is_live` still accepts
    pub fn pop_oldest(&mut self, mut is_live: impl FnMut(&K, u64) -> bool) -> Option<K> {
        while let Some((key, stamp)) = self.order.pop_front() {
            if is_live(&key, stamp) {
                return Some(key);
            }
        }
        None
    }

    /// Drop stale entries once they dominate the queue
    pub fn compact(&mut self, live: usize, mut is_live: impl FnMut(&K, u64) -> bool) {
        if self.order.len() > live.saturating_mul(2) + COMPACT_SLACK {
            self.order.retain(|(key, stamp)| is_live(key, *stamp));
        }
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.order.len()
    }
}
