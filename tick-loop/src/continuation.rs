//! Double-buffered one-shot continuations.

use core::{
    cell::{RefCell, UnsafeCell},
    mem,
    panic::AssertUnwindSafe,
};
use std::{panic, task::Waker};

use critical_section::Mutex;
use tick_core::{Fault, report_unhandled};

pub(crate) enum Continuation {
    Wake(Waker),
    Call(Box<dyn FnOnce() + Send>),
}

impl Continuation {
    fn run(self) {
        match self {
            Self::Wake(waker) => waker.wake(),
            Self::Call(call) => call(),
        }
    }
}

/// Continuations enqueued go to `waiting`; a drain swaps the buffers first,
/// so whatever a running continuation enqueues waits for the next drain.
pub(crate) struct ContinuationQueue {
    waiting: Mutex<RefCell<Vec<Continuation>>>,
    /// Owned by the driving thread; empty between drains.
    active: UnsafeCell<Vec<Continuation>>,
}

// Safety: `active` is only touched in `drain`, on the driving thread.
unsafe impl Send for ContinuationQueue {}
unsafe impl Sync for ContinuationQueue {}

impl ContinuationQueue {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            waiting: Mutex::new(RefCell::new(Vec::with_capacity(capacity))),
            active: UnsafeCell::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn enqueue(&self, continuation: Continuation) {
        critical_section::with(|cs| {
            self.waiting.borrow_ref_mut(cs).push(continuation)
        });
    }

    pub(crate) fn len(&self) -> usize {
        critical_section::with(|cs| self.waiting.borrow_ref(cs).len())
    }

    /// Runs everything enqueued before this call.
    ///
    /// # Safety
    ///
    /// Must be called on the driving thread, never from inside another drain
    /// of the same queue.
    pub(crate) unsafe fn drain(&self) {
        // Safety: see above.
        let active = unsafe { &mut *self.active.get() };
        critical_section::with(|cs| {
            mem::swap(active, &mut *self.waiting.borrow_ref_mut(cs))
        });

        // the emptied buffer keeps its capacity for the next swap
        for continuation in active.drain(..) {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(|| continuation.run()))
            {
                report_unhandled(&Fault::from_panic(payload));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn nested_continuations_wait_for_the_next_drain() {
        let queue = Arc::new(ContinuationQueue::with_capacity(4));
        let outer = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(AtomicUsize::new(0));

        let (requeue, outer_hits, inner_hits) =
            (queue.clone(), outer.clone(), inner.clone());
        queue.enqueue(Continuation::Call(Box::new(move || {
            outer_hits.fetch_add(1, Ordering::SeqCst);
            requeue.enqueue(Continuation::Call(Box::new(move || {
                inner_hits.fetch_add(1, Ordering::SeqCst);
            })));
        })));

        unsafe { queue.drain() };
        assert_eq!(outer.load(Ordering::SeqCst), 1);
        assert_eq!(inner.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);

        unsafe { queue.drain() };
        assert_eq!(inner.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn panicking_continuation_does_not_stop_the_drain() {
        let queue = ContinuationQueue::with_capacity(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let after = hits.clone();

        queue.enqueue(Continuation::Call(Box::new(|| {
            panic!("continuation::panics")
        })));
        queue.enqueue(Continuation::Call(Box::new(move || {
            after.fetch_add(1, Ordering::SeqCst);
        })));

        unsafe { queue.drain() };
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
