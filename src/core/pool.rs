//! Lock-Free Descriptor Pool
//!
//! Bounded pools are filled to capacity saat konstruksi and never allocate
//! again, so pool exhaustion doubles as the admission-control signal for
//! new connections. Acquire and release are safe from any thread.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::{ArrayQueue, SegQueue};
use tracing::{debug, trace};

use super::descriptor::Descriptor;
use crate::error::{Error, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Ceiling on the number of descriptors a pool manages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(usize),
    Unbounded,
}

impl Capacity {
    /// `None` for unbounded pools
    pub fn limit(&self) -> Option<usize> {
        match self {
            Capacity::Bounded(n) => Some(*n),
            Capacity::Unbounded => None,
        }
    }
}

impl From<usize> for Capacity {
    fn from(n: usize) -> Self {
        Capacity::Bounded(n)
    }
}

enum Freelist {
    Bounded(ArrayQueue<Descriptor>),
    Unbounded(SegQueue<Descriptor>),
}

impl Freelist {
    fn len(&self) -> usize {
        match self {
            Freelist::Bounded(q) => q.len(),
            Freelist::Unbounded(q) => q.len(),
        }
    }
}

/// Pool of pre-allocated receive descriptors
pub struct DescriptorPool {
    id: u64,
    capacity: Capacity,
    buffer_size: usize,
    free: Freelist,
    // Descriptors currently owned outside the pool
    outstanding: AtomicUsize,
    // Total ever allocated (== capacity for bounded pools)
    allocated: AtomicUsize,
}

impl DescriptorPool {
    /// Membuat pool baru. Bounded pools are eagerly filled.
    pub fn new(capacity: Capacity, buffer_size: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        let free = match capacity {
            Capacity::Bounded(n) => {
                // ArrayQueue rejects zero capacity; a 0-sized pool simply never
                // receives a descriptor.
                let queue = ArrayQueue::new(n.max(1));
                for slot in 0..n {
                    let _ = queue.push(Descriptor::new(id, slot, buffer_size));
                }
                Freelist::Bounded(queue)
            }
            Capacity::Unbounded => Freelist::Unbounded(SegQueue::new()),
        };

        let allocated = capacity.limit().unwrap_or(0);
        debug!(pool = id, ?capacity, buffer_size, "Descriptor pool created");

        Self {
            id,
            capacity,
            buffer_size,
            free,
            outstanding: AtomicUsize::new(0),
            allocated: AtomicUsize::new(allocated),
        }
    }

    pub fn bounded(capacity: usize, buffer_size: usize) -> Self {
        Self::new(Capacity::Bounded(capacity), buffer_size)
    }

    pub fn unbounded(buffer_size: usize) -> Self {
        Self::new(Capacity::Unbounded, buffer_size)
    }

    /// Take a descriptor out of the pool.
    ///
    /// Returns `None` when a bounded pool is exhausted. Never blocks.
    #[inline]
    pub fn acquire(&self) -> Option<Descriptor> {
        let descriptor = match &self.free {
            Freelist::Bounded(q) => q.pop()?,
            Freelist::Unbounded(q) => q.pop().unwrap_or_else(|| {
                let slot = self.allocated.fetch_add(1, Ordering::Relaxed);
                Descriptor::new(self.id, slot, self.buffer_size)
            }),
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        trace!(pool = self.id, slot = descriptor.slot(), "Descriptor acquired");
        Some(descriptor)
    }

    /// Return a descriptor to the pool it was taken from.
    ///
    /// # Errors
    /// `Error::InvalidArgument` when the descriptor belongs to another pool
    /// or is a detached descriptor.
    pub fn release(&self, descriptor: Descriptor) -> Result<()> {
        if descriptor.pool_id() != self.id {
            return Err(Error::invalid_argument(format!(
                "descriptor {:?} does not belong to pool {}",
                descriptor, self.id
            )));
        }

        let slot = descriptor.slot();

        // Decrement before the push so `outstanding` never over-counts while
        // another thread grabs the descriptor we just returned.
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        match &self.free {
            Freelist::Bounded(q) => {
                if let Err(rejected) = q.push(descriptor) {
                    self.outstanding.fetch_add(1, Ordering::AcqRel);
                    return Err(Error::invalid_argument(format!(
                        "pool {} is already full, cannot take {:?}",
                        self.id, rejected
                    )));
                }
            }
            Freelist::Unbounded(q) => q.push(descriptor),
        }

        trace!(pool = self.id, slot, "Descriptor released");
        Ok(())
    }

    /// Number of descriptors available right now. Advisory only.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.free.len()
    }

    /// Number of descriptors currently owned outside the pool
    #[inline(always)]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    #[inline(always)]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("available", &self.size())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
