//! Pooled poll-list promise shared by the delay and wait families.

use core::{
    any::type_name,
    cell::RefCell,
    panic::{AssertUnwindSafe, Location},
    sync::atomic::{AtomicU64, Ordering},
    task::Poll,
};
use std::{
    panic,
    sync::{Arc, Weak},
    task::Waker,
};

use critical_section::Mutex;
use tick_core::{
    CancelReason, CancelToken, CompletionCore, Fault, Status, Task, TaskError,
    TaskSource, TrackingSlot,
    pooled::{give_back, rent},
};

use crate::{
    phase::{TickContext, TickOptions},
    poll_list::PollItem,
    runtime::Runtime,
};

/// Per-kind behaviour of a [`PollPromise`].
pub(crate) trait Advance: Send + 'static {
    type Output: Send + 'static;

    /// Called once per tick until it returns `Ready`. `created_tick` is the
    /// phase's tick count when the promise was started.
    fn advance(
        &mut self,
        cx: &TickContext,
        created_tick: u64,
    ) -> Poll<Result<Self::Output, TaskError>>;
}

struct Armed<S> {
    state: S,
    token: CancelToken,
    /// Live cancel generation of the runtime the promise was started on.
    cancel_signal: Arc<AtomicU64>,
    generation: u64,
    created_tick: u64,
}

impl<S> Armed<S> {
    fn canceled_by_generation(&self) -> bool {
        self.cancel_signal.load(Ordering::Acquire) > self.generation
    }
}

/// A completion core that is also a poll item.
///
/// The armed state is taken out for the duration of an advance, so user code
/// never runs inside the critical section, and is dropped before the core is
/// completed: completing may recycle this very object.
pub(crate) struct PollPromise<S: Advance> {
    core: CompletionCore<S::Output>,
    armed: Mutex<RefCell<Option<Armed<S>>>>,
    tracking: TrackingSlot,
    me: Weak<Self>,
}

pub(crate) fn cancel_reason(token: &CancelToken) -> CancelReason {
    token.reason().unwrap_or(CancelReason::Requested)
}

impl<S: Advance> PollPromise<S> {
    /// Arms a pooled promise with `state` and adds it to the current
    /// runtime's poll list.
    #[track_caller]
    pub(crate) fn start(state: S, options: TickOptions) -> Task<S::Output> {
        let TickOptions { phase, token } = options;
        if token.is_canceled() {
            return Task::canceled(cancel_reason(&token));
        }
        let runtime = Runtime::current();

        let promise = rent(|me| Self {
            core: CompletionCore::new(),
            armed: Mutex::new(RefCell::new(None)),
            tracking: TrackingSlot::new(),
            me: me.clone(),
        });
        promise.core.arm();
        promise
            .tracking
            .created(type_name::<S>(), Location::caller());

        let armed = Armed {
            state,
            token,
            cancel_signal: runtime.cancel_signal(),
            generation: runtime.cancel_generation(),
            created_tick: runtime.tick_count(phase),
        };
        critical_section::with(|cs| promise.armed.replace(cs, Some(armed)));

        let task = Task::from_source(promise.clone(), promise.core.version());
        runtime.add_poll_item(phase, promise);
        task
    }

    fn try_return(&self) {
        self.tracking.retired();
        self.core.reset();
        give_back(&self.me);
    }
}

impl<S: Advance> PollItem for PollPromise<S> {
    fn advance(&self, cx: &TickContext) -> Poll<()> {
        let Some(mut armed) =
            critical_section::with(|cs| self.armed.take(cs))
        else {
            return Poll::Ready(());
        };

        let outcome = if armed.token.is_canceled() {
            Poll::Ready(Err(TaskError::Canceled(cancel_reason(&armed.token))))
        } else if armed.canceled_by_generation() {
            Poll::Ready(Err(TaskError::Canceled(CancelReason::CancelAll)))
        } else {
            let created_tick = armed.created_tick;
            panic::catch_unwind(AssertUnwindSafe(|| {
                armed.state.advance(cx, created_tick)
            }))
            .unwrap_or_else(|payload| {
                Poll::Ready(Err(TaskError::Faulted(Fault::from_panic(payload))))
            })
        };

        match outcome {
            Poll::Pending => {
                critical_section::with(|cs| {
                    self.armed.replace(cs, Some(armed))
                });
                Poll::Pending
            }
            Poll::Ready(result) => {
                drop(armed);
                self.core.try_set(result);
                Poll::Ready(())
            }
        }
    }
}

impl<S: Advance> TaskSource<S::Output> for PollPromise<S> {
    fn status(&self, token: u16) -> Status {
        self.core.status(token)
    }

    fn on_completed(&self, waker: &Waker, token: u16) {
        self.core.on_completed(waker, token)
    }

    fn get_result(&self, token: u16) -> Result<S::Output, TaskError> {
        let result = self.core.get_result(token);
        self.try_return();
        result
    }

    fn unsafe_status(&self) -> Status {
        self.core.unsafe_status()
    }
}
