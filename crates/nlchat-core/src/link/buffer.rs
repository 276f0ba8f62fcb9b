//! Bounded receive buffer
//!
//! Accumulates bytes between read notifications until the codec finds a
//! complete packet. When the ceiling is exceeded the oldest data is dropped
//! and only the newest half is kept.

use super::DEFAULT_BUFFER_SIZE;

/// Byte accumulator with a hard capacity ceiling
#[derive(Debug, Clone)]
pub struct LinkBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Default for LinkBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

impl LinkBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            // Reserve lazily for large ceilings, the default is 10 MiB
            data: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append newly read bytes, applying the overflow policy
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.enforce_ceiling();
    }

    /// Remove and return the first `n` bytes
    pub fn consume_prefix(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        self.data.drain(..n).collect()
    }

    /// Change the ceiling, trimming if the current contents no longer fit
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.enforce_ceiling();
    }

    /// Find `pattern` at or after `from`
    pub fn find(&self, pattern: &[u8], from: usize) -> Option<usize> {
        if pattern.is_empty() || from > self.data.len() {
            return None;
        }
        self.data[from..]
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|pos| pos + from)
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capacity ceiling
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn enforce_ceiling(&mut self) {
        if self.data.len() <= self.capacity {
            return;
        }
        let keep = self.capacity.div_ceil(2);
        let dropped = self.data.len() - keep;
        self.data.drain(..dropped);
        tracing::debug!(
            dropped,
            kept = keep,
            capacity = self.capacity,
            "receive buffer overflow, discarded oldest bytes"
        );
    }
}
