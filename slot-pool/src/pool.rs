use core::{
    cell::RefCell,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::sync::Arc;

use critical_section::Mutex;

/// Default upper bound on the number of idle objects a pool retains.
pub const DEFAULT_MAX_SIZE: usize = 1024;

/// Bounded free-list of reference counted objects.
///
/// A `TaskPool` does not construct anything itself. Callers pop an idle
/// object, fall back to allocating a fresh one on a miss, and push the object
/// back once it has been reset. Pushing into a full pool discards the object.
///
/// The free-list is guarded by a critical section, so popping and pushing are
/// safe from any thread, but neither operation ever runs foreign code while
/// the section is held.
pub struct TaskPool<T> {
    name: &'static str,
    /// Idle objects, most recently returned last.
    items: Mutex<RefCell<Vec<Arc<T>>>>,
    max_size: AtomicUsize,
}

impl<T> TaskPool<T> {
    /// Creates an empty pool named `name` for diagnostics.
    #[inline]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Mutex::new(RefCell::new(Vec::new())),
            max_size: AtomicUsize::new(DEFAULT_MAX_SIZE),
        }
    }

    /// Name reported through [`pool_sizes`](crate::pool_sizes).
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Takes an idle object out of the pool, if there is one.
    #[inline]
    pub fn try_pop(&self) -> Option<Arc<T>> {
        critical_section::with(|cs| self.items.borrow_ref_mut(cs).pop())
    }

    /// Takes an idle object out of the pool or builds a new one with
    /// `create` on a miss.
    #[inline]
    pub fn pop_or_else(&self, create: impl FnOnce() -> Arc<T>) -> Arc<T> {
        match self.try_pop() {
            Some(item) => item,
            None => {
                tracing::trace!(pool = self.name, "pool miss");
                create()
            }
        }
    }

    /// Returns `item` to the pool.
    ///
    /// Returns `false` and drops `item` when the pool is already holding
    /// [`max_size`](Self::max_size) idle objects.
    pub fn try_push(&self, item: Arc<T>) -> bool {
        let max_size = self.max_size.load(Ordering::Relaxed);
        let rejected = critical_section::with(|cs| {
            let mut items = self.items.borrow_ref_mut(cs);
            if items.len() < max_size {
                items.push(item);
                None
            } else {
                Some(item)
            }
        });

        // dropped outside the critical section, `T::drop` may report faults
        match rejected {
            None => true,
            Some(item) => {
                tracing::debug!(
                    pool = self.name,
                    max_size,
                    "pool full, discarding"
                );
                drop(item);
                false
            }
        }
    }

    /// Number of idle objects currently held.
    #[inline]
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.items.borrow_ref(cs).len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Changes the bound, trimming idle objects above it.
    pub fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Relaxed);
        let trimmed = critical_section::with(|cs| {
            let mut items = self.items.borrow_ref_mut(cs);
            if items.len() > max_size {
                items.split_off(max_size)
            } else {
                Vec::new()
            }
        });
        drop(trimmed);
    }
}
