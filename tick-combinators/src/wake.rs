use core::cell::RefCell;
use std::{
    sync::{Arc, Weak},
    task::{Wake, Waker},
};

use critical_section::Mutex;
use slot_pool::pool_of;

/// A parent that multiplexes the continuations of several inputs.
pub(crate) trait IndexedWake: Send + Sync + 'static {
    /// Input `index` completed.
    fn wake_index(&self, index: usize);
}

/// Routes one input's continuation back into its parent.
///
/// Stores are pooled per parent type and hand themselves back once fired,
/// so registering a continuation per input does not allocate in the steady
/// state. Sources consume their waker when they fire it, so no handle to a
/// recycled store is left behind.
pub(crate) struct WakeStore<P> {
    parent: Mutex<RefCell<Option<(Arc<P>, usize)>>>,
    me: Weak<Self>,
}

impl<P: IndexedWake> WakeStore<P> {
    fn fire(&self) {
        let parent = critical_section::with(|cs| self.parent.take(cs));
        let Some((parent, index)) = parent else { return };
        parent.wake_index(index);
        drop(parent);
        if let Some(me) = self.me.upgrade() {
            pool_of::<Self>().try_push(me);
        }
    }
}

impl<P: IndexedWake> Wake for WakeStore<P> {
    fn wake(self: Arc<Self>) {
        self.fire();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.fire();
    }
}

/// Waker that reports completion of input `index` to `parent`, once.
pub(crate) fn index_waker<P: IndexedWake>(
    parent: &Arc<P>,
    index: usize,
) -> Waker {
    let store = pool_of::<WakeStore<P>>().pop_or_else(|| {
        Arc::new_cyclic(|me| WakeStore {
            parent: Mutex::new(RefCell::new(None)),
            me: me.clone(),
        })
    });
    critical_section::with(|cs| {
        store.parent.replace(cs, Some((parent.clone(), index)))
    });
    Waker::from(store)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<usize>>);

    impl IndexedWake for Recorder {
        fn wake_index(&self, index: usize) {
            self.0.lock().unwrap().push(index);
        }
    }

    #[test]
    fn fires_once_with_its_index() {
        let parent = Arc::new(Recorder::default());
        let first = index_waker(&parent, 3);
        let second = index_waker(&parent, 5);

        second.wake_by_ref();
        first.clone().wake();
        first.wake();
        second.wake();

        assert_eq!(*parent.0.lock().unwrap(), vec![5, 3]);
    }
}
