//! Echo-hash deduplication.
//!
//! At-least-once delivery means peers redeliver until acked. A message
//! seen before is answered with a fresh ack and nothing else: no state
//! transition, no new events.

use std::num::NonZeroUsize;

use lru::LruCache;

const DEFAULT_CAPACITY: usize = 10_000;

/// LRU set of already-processed echo hashes.
pub struct EchoFilter {
    seen: LruCache<[u8; 32], ()>,
}

impl EchoFilter {
    /// Create a filter holding up to `capacity` hashes.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        EchoFilter { seen: LruCache::new(capacity) }
    }

    /// Record an echo hash. Returns true when it is new, false when the
    /// message was already processed.
    pub fn record(&mut self, echo_hash: [u8; 32]) -> bool {
        if self.seen.contains(&echo_hash) {
            false
        } else {
            self.seen.put(echo_hash, ());
            true
        }
    }

    /// Whether an echo hash was already processed.
    pub fn contains(&self, echo_hash: &[u8; 32]) -> bool {
        self.seen.contains(echo_hash)
    }

    /// Number of remembered hashes.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the filter remembers nothing.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for EchoFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
