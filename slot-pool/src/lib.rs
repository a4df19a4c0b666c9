//! Recycling of reference counted task objects.
//!
//! Each concrete object type gets its own bounded free-list
//! ([`TaskPool`]). Objects are handed out as `Arc<T>` so they can be shared
//! between a handle, a scheduler slot and a producer, and are returned once
//! their owner has reset them. Reuse is detected by the owner (usually with
//! a version counter), not by the pool.

pub mod pool;
pub mod registry;

pub use pool::{DEFAULT_MAX_SIZE, TaskPool};
pub use registry::{
    PoolSize, PoolStats, pool_of, pool_sizes, set_default_max_size,
};
