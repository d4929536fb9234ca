//! A pool of equal-length byte buffers.
//!
//! The framing layer acquires one buffer per record and returns it before
//! blocking for the next, so a long-lived idle stream pins no large
//! allocation. To encourage correct usage, buffers are only reachable
//! through a [`Lease`], which holds zero or one buffers at a time.

use parking_lot::Mutex;

/// A pool of byte buffers that all share one fixed length.
///
/// The pool does not bound how many buffers it retains; reclamation is
/// left to the allocator. Callers that need isolation from the
/// process-wide pool can create their own.
#[derive(Debug)]
pub struct Pool {
    len: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl Pool {
    /// Creates a pool of buffers of `len` bytes each.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            free: Mutex::new(Vec::new()),
        }
    }

    /// The length of every buffer in this pool.
    pub fn buf_len(&self) -> usize {
        self.len
    }

    fn get(&self) -> Vec<u8> {
        self.free.lock().pop().unwrap_or_else(|| vec![0u8; self.len])
    }

    fn put(&self, buf: Vec<u8>) {
        assert!(
            buf.len() == self.len && buf.capacity() >= self.len,
            "buffer length mismatch"
        );
        self.free.lock().push(buf);
    }
}

/// A handle holding zero or one buffers from a particular [`Pool`].
#[derive(Debug)]
pub struct Lease<'a> {
    pool: &'a Pool,
    buf: Option<Vec<u8>>,
}

impl<'a> Lease<'a> {
    /// Creates an empty `Lease` tied to `pool`.
    pub fn new(pool: &'a Pool) -> Self {
        Self { pool, buf: None }
    }

    /// Takes a buffer from the pool and returns it.
    ///
    /// # Panics
    ///
    /// Panics if this lease already holds a buffer.
    pub fn acquire(&mut self) -> &mut [u8] {
        assert!(self.buf.is_none(), "buffer already acquired");
        self.buf = Some(self.pool.get());
        self.buf.as_mut().expect("buffer was just acquired")
    }

    /// The held buffer.
    ///
    /// # Panics
    ///
    /// Panics if no buffer is held.
    pub fn buf(&self) -> &[u8] {
        self.buf.as_deref().expect("no buffer acquired")
    }

    /// The held buffer, mutably.
    ///
    /// # Panics
    ///
    /// Panics if no buffer is held.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("no buffer acquired")
    }

    /// Returns the buffer to the pool. A no-op on an empty lease.
    ///
    /// The caller must discard any view into the buffer.
    pub fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
