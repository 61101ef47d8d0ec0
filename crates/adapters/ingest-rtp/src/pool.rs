//! Fixed-size block pool for datagram receive
//!
//! Preallocates every buffer up front and recycles them for the lifetime
//! of the adapter, so steady-state receive does no per-packet allocation.
//! Checkout blocks the calling thread when the pool is drained; that stall
//! is the backpressure path, not a failure, which is why `get` has no
//! error return.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

struct PoolInner {
    block_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    returned: Condvar,
}

/// Bounded pool of reusable fixed-size buffers
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// Create a pool of `count` blocks of `block_size` bytes each.
    pub fn new(block_size: usize, count: usize) -> Self {
        let free = (0..count)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                block_size,
                free: Mutex::new(free),
                returned: Condvar::new(),
            }),
        }
    }

    /// Check out a block, parking the calling thread until one is free.
    pub fn get(&self) -> Block {
        let mut free = self.inner.free.lock().unwrap();
        loop {
            if let Some(buf) = free.pop() {
                return Block {
                    buf: Some(buf),
                    len: self.inner.block_size,
                    pool: Arc::clone(&self.inner),
                };
            }
            free = self.inner.returned.wait(free).unwrap();
        }
    }

    /// Check out a block without waiting; `None` means the pool is drained.
    pub fn try_get(&self) -> Option<Block> {
        let buf = self.inner.free.lock().unwrap().pop()?;
        Some(Block {
            buf: Some(buf),
            len: self.inner.block_size,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Size of every block in the pool
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Number of blocks currently checked in
    pub fn available(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// A checked-out pool buffer; returns itself to the pool on drop.
///
/// Dereferences to the first `len` bytes, where `len` starts at the block
/// size and shrinks once [`Block::truncate`] records the real payload
/// length.
pub struct Block {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl Block {
    /// Copy `src` into the block and truncate the view to its length.
    ///
    /// Panics if `src` exceeds the block size; callers size the pool's
    /// blocks to the transport MTU.
    pub fn copy_from(&mut self, src: &[u8]) {
        let buf = self.buf.as_mut().unwrap();
        buf[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }

    /// Shrink the visible payload to `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Visible payload length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the visible payload is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().unwrap()[..self.len]
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().unwrap()[..self.len]
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().unwrap().push(buf);
            self.pool.returned.notify_one();
        }
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block").field("len", &self.len).finish()
    }
}
