// Buffer pool: reusable byte buffers for ring chunks, to keep the hot
// write/read path free of per-chunk allocations.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Statistics for buffer pool operations.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Number of new buffer allocations
    pub allocations: u64,
    /// Number of buffer reuses from pool
    pub reuses: u64,
    /// Current number of buffers in the pool
    pub current_pool_size: usize,
}

/// Thread-safe pool of `Vec<u8>` buffers.
///
/// Buffers are handed out with at least the requested capacity and returned
/// cleared. Zero-capacity returns are ignored, which makes a double release
/// of the same logical buffer harmless.
pub struct BufferPool {
    pool: Mutex<Vec<Vec<u8>>>,
    /// Maximum buffers retained; extra releases are dropped.
    max_pooled: usize,
    /// Capacity given to fresh allocations when the request is smaller.
    default_capacity: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    pub fn new(max_pooled: usize, default_capacity: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            max_pooled,
            default_capacity,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }

    /// Acquire a buffer with at least `min_capacity` bytes of capacity.
    pub fn acquire(&self, min_capacity: usize) -> Vec<u8> {
        {
            let mut pool = self.pool.lock();
            if let Some(pos) = pool.iter().position(|buf| buf.capacity() >= min_capacity) {
                let buffer = pool.swap_remove(pos);
                self.reuses.fetch_add(1, Ordering::Relaxed);
                return buffer;
            }
        }

        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(min_capacity, "Buffer pool empty, allocating");
        Vec::with_capacity(min_capacity.max(self.default_capacity))
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is cleared before being retained. Buffers with no backing
    /// capacity are dropped silently, as are buffers beyond the pool cap.
    pub fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() == 0 {
            return;
        }
        buffer.clear();

        let mut pool = self.pool.lock();
        if pool.len() < self.max_pooled {
            pool.push(buffer);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let pool = self.pool.lock();
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            current_pool_size: pool.len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        // Enough slack for one ring of default size plus in-flight copies.
        Self::new(32, 64 * 1024)
    }
}
