use parking_lot::Mutex;
use std::{
    mem,
    ops::{Deref, DerefMut},
    sync::OnceLock,
};

/// Sizing of the process-wide buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Capacity of freshly allocated buffers.
    pub default_size: usize,
    /// Largest capacity returned to the pool; bigger buffers are dropped.
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { default_size: 256, max_size: 64 * 1024 }
    }
}

static POOL: OnceLock<BufferPool> = OnceLock::new();

/// Installs the global pool configuration. Returns `false` when the pool
/// was already initialized; the first use installs the defaults.
pub fn init(config: PoolConfig) -> bool {
    POOL.set(BufferPool::new(config)).is_ok()
}

/// Borrows a cleared buffer with at least `min_capacity` bytes of capacity
/// from the global pool.
pub fn buffer(min_capacity: usize) -> PooledBuf<'static> {
    POOL.get_or_init(|| BufferPool::new(PoolConfig::default())).get(min_capacity)
}

/// A bounded pool of reusable byte buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    config: PoolConfig,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool with the given sizing.
    pub fn new(config: PoolConfig) -> Self {
        Self { config, free: Mutex::new(Vec::new()) }
    }

    /// Borrows a cleared buffer, reusing a pooled allocation when one is
    /// available.
    pub fn get(&self, min_capacity: usize) -> PooledBuf<'_> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        let want = min_capacity.max(self.config.default_size);
        if buf.capacity() < want {
            buf.reserve(want - buf.len());
        }
        PooledBuf { buf, pool: self }
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.capacity() <= self.config.max_size {
            self.free.lock().push(buf);
        }
    }

    #[cfg(test)]
    fn free_buffers(&self) -> usize {
        self.free.lock().len()
    }
}

/// A buffer borrowed from a [`BufferPool`]. The backing storage returns to
/// the pool when the guard drops, on every exit path.
#[derive(Debug)]
pub struct PooledBuf<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.put(mem::take(&mut self.buf));
    }
}
