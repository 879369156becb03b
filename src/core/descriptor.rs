//! Reusable I/O descriptor: buffer tetap + bookkeeping
//!
//! A descriptor is allocated once and moved between its pool and the
//! connection that owns it. It is never cloned, so "in the pool" and
//! "owned by a connection" are exclusive by construction.

use std::fmt;

/// Default buffer size, 8k is a good size to go
pub const DEFAULT_BUFFER_SIZE: usize = 8000;

/// Pool id carried by descriptors that do not belong to any pool
pub(crate) const DETACHED_POOL: u64 = 0;

pub struct Descriptor {
    pool_id: u64,
    slot: usize,
    buffer: Box<[u8]>,
}

impl Descriptor {
    pub(crate) fn new(pool_id: u64, slot: usize, buffer_size: usize) -> Self {
        Self {
            pool_id,
            slot,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
        }
    }

    /// Descriptor dedicated to a single owner (e.g. a client session).
    ///
    /// No pool accepts it on release.
    pub(crate) fn detached(buffer_size: usize) -> Self {
        Self::new(DETACHED_POOL, 0, buffer_size)
    }

    #[inline(always)]
    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Index assigned when the descriptor was allocated
    #[inline(always)]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Copy exactly the first `len` bytes out of the buffer.
    ///
    /// The buffer is reused by the next receive, so callers never get a
    /// view into it.
    #[inline]
    pub fn copy_filled(&self, len: usize) -> Vec<u8> {
        self.buffer[..len.min(self.buffer.len())].to_vec()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("pool_id", &self.pool_id)
            .field("slot", &self.slot)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_filled_is_exact() {
        let mut d = Descriptor::detached(16);
        d.buffer_mut()[..4].copy_from_slice(b"ping");

        assert_eq!(d.copy_filled(4), b"ping".to_vec());
        assert_eq!(d.copy_filled(0), Vec::<u8>::new());
        // Never reads past the buffer
        assert_eq!(d.copy_filled(64).len(), 16);
    }

    #[test]
    fn test_detached_has_no_pool() {
        let d = Descriptor::detached(DEFAULT_BUFFER_SIZE);
        assert_eq!(d.pool_id(), DETACHED_POOL);
        assert_eq!(d.capacity(), DEFAULT_BUFFER_SIZE);
    }
}
