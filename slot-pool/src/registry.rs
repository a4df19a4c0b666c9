use core::{
    any::{Any, TypeId, type_name},
    cell::RefCell,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::collections::HashMap;

use critical_section::Mutex;

use crate::pool::{DEFAULT_MAX_SIZE, TaskPool};

/// Size-getter registered for every pool handed out by [`pool_of`].
pub trait PoolStats: Send + Sync {
    fn name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn set_max_size(&self, max_size: usize);
}

impl<T: Send + Sync> PoolStats for TaskPool<T> {
    fn name(&self) -> &'static str {
        TaskPool::name(self)
    }

    fn len(&self) -> usize {
        TaskPool::len(self)
    }

    fn set_max_size(&self, max_size: usize) {
        TaskPool::set_max_size(self, max_size)
    }
}

/// Snapshot of one registered pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSize {
    pub name: &'static str,
    pub len: usize,
}

struct Entry {
    pool: &'static (dyn Any + Send + Sync),
    stats: &'static dyn PoolStats,
}

static REGISTRY: Mutex<RefCell<Option<HashMap<TypeId, Entry>>>> =
    Mutex::new(RefCell::new(None));

static DEFAULT_MAX: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_SIZE);

/// Returns the process-wide pool for `T`, creating and registering it on
/// first use.
///
/// Rust has no generic statics, so every concrete object type (including
/// each instantiation of a generic promise) gets its own leaked pool, looked
/// up by `TypeId`. Pools live for the rest of the process.
pub fn pool_of<T: Send + Sync + 'static>() -> &'static TaskPool<T> {
    let id = TypeId::of::<T>();
    let pool = critical_section::with(|cs| {
        let mut registry = REGISTRY.borrow_ref_mut(cs);
        let entry = registry
            .get_or_insert_with(HashMap::new)
            .entry(id)
            .or_insert_with(|| {
                let pool: &'static TaskPool<T> =
                    Box::leak(Box::new(TaskPool::new(type_name::<T>())));
                pool.set_max_size(DEFAULT_MAX.load(Ordering::Relaxed));
                Entry { pool, stats: pool }
            });
        entry.pool
    });

    match pool.downcast_ref::<TaskPool<T>>() {
        Some(pool) => pool,
        None => unreachable!("pool registered under a foreign TypeId"),
    }
}

/// Applies `max_size` to every registered pool and to pools created later.
pub fn set_default_max_size(max_size: usize) {
    DEFAULT_MAX.store(max_size, Ordering::Relaxed);
    for stats in registered() {
        stats.set_max_size(max_size);
    }
}

/// Lists the idle object count of every registered pool.
pub fn pool_sizes() -> Vec<PoolSize> {
    registered()
        .into_iter()
        .map(|stats| PoolSize {
            name: stats.name(),
            len: stats.len(),
        })
        .collect()
}

fn registered() -> Vec<&'static dyn PoolStats> {
    critical_section::with(|cs| {
        REGISTRY
            .borrow_ref(cs)
            .as_ref()
            .map(|pools| pools.values().map(|entry| entry.stats).collect())
            .unwrap_or_default()
    })
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    struct Marker(#[allow(dead_code)] u8);
    struct OtherMarker;

    #[test]
    fn same_type_same_pool() {
        let a = pool_of::<Marker>();
        let b = pool_of::<Marker>();
        assert!(core::ptr::eq(a, b));
    }

    #[test]
    fn distinct_types_distinct_pools() {
        let a = pool_of::<Marker>() as *const _ as *const ();
        let b = pool_of::<OtherMarker>() as *const _ as *const ();
        assert_ne!(a, b);
    }

    #[test]
    fn sizes_are_reported() {
        struct Counted;
        let pool = pool_of::<Counted>();
        assert!(pool.try_push(Arc::new(Counted)));

        let sizes = pool_sizes();
        let entry = sizes
            .iter()
            .find(|size| size.name == type_name::<Counted>())
            .expect("pool registered");
        assert_eq!(entry.len, 1);
    }
}
