//! Reusable byte buffers for the request hot path.
//!
//! Bodies and serialized cache entries are assembled in pooled buffers
//! instead of fresh allocations. A buffer that grew past
//! [`MAX_POOLED_CAPACITY`] is dropped on release so one huge response
//! cannot pin memory in the pool forever.

use hyper::body::HttpBody;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

const INITIAL_CAPACITY: usize = 8 * 1024;
const MAX_POOLED_CAPACITY: usize = 256 * 1024;

/// A shared free list of byte buffers.
///
/// Cloning the pool is cheap; all clones hand out buffers from the same
/// free list. A checked-out [`PooledBuf`] is exclusively owned by its
/// borrower and returns to the pool on drop.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn get(&self) -> PooledBuf {
        let mut buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_CAPACITY));
        buf.clear();
        PooledBuf {
            buf,
            pool: Arc::clone(&self.free),
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if self.buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        let buf = std::mem::take(&mut self.buf);
        self.pool.lock().push(buf);
    }
}

/// Read an entire [`hyper::Body`] into `buf`.
pub async fn read_body(body: &mut hyper::Body, buf: &mut Vec<u8>) -> Result<(), hyper::Error> {
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
    }
    Ok(())
}
