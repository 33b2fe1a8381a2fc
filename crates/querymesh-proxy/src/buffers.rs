//! Process-wide pool of reusable byte buffers
//!
//! Every streaming cursor leases one buffer for the lifetime of its request
//! and returns it on close, so steady-state fan-out does not allocate per
//! request.

use std::sync::Mutex;

/// Initial capacity of a freshly allocated pooled buffer.
const INITIAL_BUF_SIZE: usize = 1024;

/// A simple free-list of byte buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a buffer. The buffer is empty but may retain capacity from a
    /// previous lease.
    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(INITIAL_BUF_SIZE))
    }

    /// Return a leased buffer.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .push(buf);
    }
}
