//! Circular buffer for output replay when a viewer connects.
//!
//! Stores the last N bytes of PTY output so that a late-joining viewer
//! can receive a scrollback snapshot without the server keeping unbounded history.

/// Default replay capacity (1 MiB).
pub const DEFAULT_REPLAY_CAPACITY: usize = 1024 * 1024;

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct ReplayBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Index of the oldest retained byte.
    head: usize,
    /// Number of valid bytes currently stored.
    size: usize,
    /// Total bytes ever appended.
    total_written: u64,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl ReplayBuffer {
    /// Create a new replay buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            head: 0,
            size: 0,
            total_written: 0,
        }
    }

    /// Append data as the newest bytes, discarding the oldest on overflow.
    pub fn append(&mut self, data: &[u8]) {
        let len = data.len();
        if len == 0 || self.capacity == 0 {
            return;
        }
        self.total_written += len as u64;

        if len >= self.capacity {
            self.buf.copy_from_slice(&data[len - self.capacity..]);
            self.head = 0;
            self.size = self.capacity;
            return;
        }

        let write_start = (self.head + self.size) % self.capacity;
        let space_to_end = self.capacity - write_start;
        if len <= space_to_end {
            self.buf[write_start..write_start + len].copy_from_slice(data);
        } else {
            self.buf[write_start..].copy_from_slice(&data[..space_to_end]);
            self.buf[..len - space_to_end].copy_from_slice(&data[space_to_end..]);
        }

        let new_size = self.size + len;
        if new_size > self.capacity {
            let overflow = new_size - self.capacity;
            self.head = (self.head + overflow) % self.capacity;
            self.size = self.capacity;
        } else {
            self.size = new_size;
        }
    }

    /// Copy out all buffered data, oldest byte first.
    pub fn contents(&self) -> Vec<u8> {
        if self.size == 0 {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(self.size);
        let tail_len = self.size.min(self.capacity - self.head);
        result.extend_from_slice(&self.buf[self.head..self.head + tail_len]);
        if tail_len < self.size {
            // Wrapped: the rest starts at index 0
            result.extend_from_slice(&self.buf[..self.size - tail_len]);
        }
        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.size
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever appended through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Empty the buffer, keeping its storage.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn clear(&mut self) {
        self.head = 0;
        self.size = 0;
        self.total_written = 0;
    }
}
