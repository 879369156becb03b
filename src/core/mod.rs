//! Core module: descriptor pooling dan endpoint resolution
//!
//! Prinsip desain:
//! - No-Allocation: receive buffers are allocated once, then recycled
//! - Lock-Free: the pool is a crossbeam queue, safe from any driver thread
//! - Exclusive ownership: a descriptor lives in the pool or in one connection

mod descriptor;
mod pool;
mod resolver;

pub use descriptor::{Descriptor, DEFAULT_BUFFER_SIZE};
pub use pool::{Capacity, DescriptorPool};
pub use resolver::resolve;
