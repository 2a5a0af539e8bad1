//! Reusable buffer pool for part reconstruction
//!
//! Reconstruction allocates one buffer per part, and a large install touches
//! hundreds of thousands of parts. Pooling the buffers keeps allocation
//! pressure flat regardless of part count.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Maximum pooled buffers per size tier
const MAX_SMALL_BUFFERS: usize = 64;
const MAX_MEDIUM_BUFFERS: usize = 16;
const MAX_LARGE_BUFFERS: usize = 4;

/// Tier thresholds
const SMALL_BUFFER_THRESHOLD: usize = 64 * 1024;
const MEDIUM_BUFFER_THRESHOLD: usize = 1024 * 1024;

#[derive(Default)]
struct Tiers {
    small: Mutex<VecDeque<Vec<u8>>>,
    medium: Mutex<VecDeque<Vec<u8>>>,
    large: Mutex<VecDeque<Vec<u8>>>,
}

impl Tiers {
    fn tier(&self, capacity: usize) -> (&Mutex<VecDeque<Vec<u8>>>, usize) {
        if capacity <= SMALL_BUFFER_THRESHOLD {
            (&self.small, MAX_SMALL_BUFFERS)
        } else if capacity <= MEDIUM_BUFFER_THRESHOLD {
            (&self.medium, MAX_MEDIUM_BUFFERS)
        } else {
            (&self.large, MAX_LARGE_BUFFERS)
        }
    }
}

/// Shared pool of reusable byte buffers, tiered by size
#[derive(Clone, Default)]
pub struct BufferPool {
    tiers: Arc<Tiers>,
}

impl BufferPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer of exactly `size` bytes, zero-filled
    ///
    /// The buffer returns to the pool when the guard is dropped.
    pub fn take(&self, size: usize) -> PooledBuf {
        let (tier, _) = self.tiers.tier(size);
        let mut data = tier
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.pop_front())
            .unwrap_or_default();

        data.clear();
        data.resize(size, 0);
        PooledBuf {
            data,
            pool: self.clone(),
        }
    }

    fn put_back(&self, buffer: Vec<u8>) {
        let (tier, max) = self.tiers.tier(buffer.capacity());
        if let Ok(mut buffers) = tier.lock() {
            if buffers.len() < max {
                buffers.push_back(buffer);
            }
            // Full tier: the buffer is simply dropped
        }
    }

    /// Number of buffers currently held across all tiers
    pub fn pooled_count(&self) -> usize {
        [&self.tiers.small, &self.tiers.medium, &self.tiers.large]
            .iter()
            .map(|tier| tier.lock().map(|buffers| buffers.len()).unwrap_or(0))
            .sum()
    }
}

/// A pooled buffer that returns itself to the pool on drop
pub struct PooledBuf {
    data: Vec<u8>,
    pool: BufferPool,
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put_back(std::mem::take(&mut self.data));
    }
}
