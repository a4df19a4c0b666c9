//! Runs a `core::future::Future` as a [`Task`].
//!
//! The future is polled inline from whatever wakes it: a completion firing
//! inside a tick, a continuation drained by the runtime, or the call to
//! [`spawn`] itself. There is no executor thread and no run queue; a future
//! that never registers a waker is never polled again.

use core::{
    any::type_name,
    cell::UnsafeCell,
    future::Future,
    panic::{AssertUnwindSafe, Location},
    pin::Pin,
    sync::atomic::{AtomicU8, Ordering},
    task::{Context, Poll},
};
use std::{
    panic,
    sync::{Arc, Weak},
    task::{Wake, Waker},
};

use tick_core::{
    CompletionCore, Fault, Status, Task, TaskError, TaskSource, TrackingSlot,
    pooled::{give_back, rent},
};

const IDLE: u8 = 0;
const POLLING: u8 = 1;
/// Woken while being polled: poll once more before going idle.
const NOTIFIED: u8 = 2;
const DONE: u8 = 3;

/// Pooled driver of one spawned future.
///
/// The future lives inline in the pooled object and is dropped in place once
/// it completes, so it is never moved after the first poll.
struct Runner<F, T> {
    core: CompletionCore<T>,
    future: UnsafeCell<Option<F>>,
    state: AtomicU8,
    tracking: TrackingSlot,
    me: Weak<Self>,
}

// Safety: `future` is only touched by the thread that moved `state` to
// POLLING, or by `spawn` before the runner is shared.
unsafe impl<F: Send, T: Send> Send for Runner<F, T> {}
unsafe impl<F: Send, T: Send> Sync for Runner<F, T> {}

impl<F, T> Runner<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    fn schedule(self: &Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => POLLING,
                POLLING => NOTIFIED,
                _ => return,
            };
            match self.state.compare_exchange(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(IDLE) => return self.run(),
                Ok(_) => return,
                Err(actual) => state = actual,
            }
        }
    }

    fn run(self: &Arc<Self>) {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            // Safety: this thread owns the future while in POLLING.
            let slot = unsafe { &mut *self.future.get() };
            let Some(future) = slot.as_mut() else {
                self.state.store(DONE, Ordering::Release);
                return;
            };
            // Safety: the future is never moved out of the slot, only
            // dropped in place.
            let future = unsafe { Pin::new_unchecked(future) };

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| future.poll(&mut cx)));
            let result = match outcome {
                Ok(Poll::Pending) => {
                    if self
                        .state
                        .compare_exchange(
                            POLLING,
                            IDLE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                    self.state.store(POLLING, Ordering::Release);
                    continue;
                }
                Ok(Poll::Ready(result)) => result,
                Err(payload) => {
                    tracing::trace!(
                        future = type_name::<F>(),
                        "spawned future panicked"
                    );
                    Err(TaskError::Faulted(Fault::from_panic(payload)))
                }
            };

            let dropped = panic::catch_unwind(AssertUnwindSafe(|| {
                *slot = None;
            }));
            self.state.store(DONE, Ordering::Release);
            let result = match (result, dropped) {
                (Ok(_), Err(payload)) => {
                    Err(TaskError::Faulted(Fault::from_panic(payload)))
                }
                (result, _) => result,
            };
            self.core.try_set(result);
            return;
        }
    }

    fn try_return(&self) {
        self.tracking.retired();
        self.core.reset();
        give_back(&self.me);
    }
}

impl<F, T> Wake for Runner<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

impl<F, T> TaskSource<T> for Runner<F, T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    fn status(&self, token: u16) -> Status {
        self.core.status(token)
    }

    fn on_completed(&self, waker: &Waker, token: u16) {
        self.core.on_completed(waker, token)
    }

    fn get_result(&self, token: u16) -> Result<T, TaskError> {
        let result = self.core.get_result(token);
        self.try_return();
        result
    }

    fn unsafe_status(&self) -> Status {
        self.core.unsafe_status()
    }
}

/// Starts `future` and returns the task it completes.
///
/// The future is polled once right away; afterwards whenever something it
/// awaits wakes it. A panic while polling faults the task.
#[track_caller]
pub fn spawn<F, T>(future: F) -> Task<T>
where
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
    T: Send + 'static,
{
    let runner = rent(|me| Runner {
        core: CompletionCore::new(),
        future: UnsafeCell::new(None),
        state: AtomicU8::new(DONE),
        tracking: TrackingSlot::new(),
        me: me.clone(),
    });
    runner.core.arm();
    runner
        .tracking
        .created(type_name::<F>(), Location::caller());

    // Safety: a pooled runner is DONE, so no other thread reads the slot.
    unsafe { *runner.future.get() = Some(future) };
    let task = Task::from_source(runner.clone(), runner.core.version());
    runner.state.store(IDLE, Ordering::Release);
    runner.schedule();
    task
}
