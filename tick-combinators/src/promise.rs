//! Pooled aggregate shared by the combinators.

use core::{
    any::type_name,
    cell::RefCell,
    panic::Location,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::{
    sync::{Arc, Weak},
    task::Waker,
};

use critical_section::Mutex;
use tick_core::{
    CompletionCore, Status, Task, TaskError, TaskParts, TaskSource,
    TrackingSlot,
    pooled::{give_back, rent},
};

use crate::wake::{IndexedWake, index_waker};

/// Per-combinator behaviour of a [`Promise`].
pub(crate) trait Settle: Default + Send + Sync + Sized + 'static {
    type Output: Send + 'static;

    /// Input `index` completed; observe it and settle the aggregate if this
    /// decides it.
    fn settle(&self, index: usize, promise: &Promise<Self>);

    /// Drops whatever the last use left behind.
    fn clear(&self);
}

/// Aggregate completion core plus the combinator state feeding it.
///
/// A promise goes back to its pool once the aggregate result was consumed
/// *and* every input was observed, so a slow loser can never write into the
/// next incarnation.
pub(crate) struct Promise<S: Settle> {
    core: CompletionCore<S::Output>,
    pub(crate) state: S,
    /// Inputs still to be observed, plus one for the consumer.
    outstanding: AtomicUsize,
    tracking: TrackingSlot,
    me: Weak<Self>,
}

impl<S: Settle> Promise<S> {
    /// Rents a promise that waits on `inputs` inputs.
    #[track_caller]
    pub(crate) fn rent(inputs: usize) -> Arc<Self> {
        let promise = rent(|me| Self {
            core: CompletionCore::new(),
            state: S::default(),
            outstanding: AtomicUsize::new(0),
            tracking: TrackingSlot::new(),
            me: me.clone(),
        });
        promise.core.arm();
        promise.outstanding.store(inputs + 1, Ordering::Release);
        promise
            .tracking
            .created(type_name::<S>(), Location::caller());
        promise
    }

    pub(crate) fn task(self: &Arc<Self>) -> Task<S::Output> {
        Task::from_source(self.clone(), self.core.version())
    }

    #[inline]
    pub(crate) fn core(&self) -> &CompletionCore<S::Output> {
        &self.core
    }

    /// Hands input `index` to the state through `put`, then either listens
    /// for its completion or settles it right away.
    pub(crate) fn watch<T>(
        self: &Arc<Self>,
        index: usize,
        task: Task<T>,
        put: impl FnOnce(TaskParts<T>),
    ) {
        let parts = task.into_parts();
        let listen = match &parts {
            TaskParts::Pending { source, token }
                if !source.status(*token).is_completed() =>
            {
                Some((source.clone(), *token))
            }
            _ => None,
        };
        put(parts);

        match listen {
            Some((source, token)) => {
                source.on_completed(&index_waker(self, index), token)
            }
            None => self.wake_index(index),
        }
    }

    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.state.clear();
        self.tracking.retired();
        self.core.reset();
        give_back(&self.me);
    }
}

impl<S: Settle> IndexedWake for Promise<S> {
    fn wake_index(&self, index: usize) {
        self.state.settle(index, self);
        self.release();
    }
}

impl<S: Settle> TaskSource<S::Output> for Promise<S> {
    fn status(&self, token: u16) -> Status {
        self.core.status(token)
    }

    fn on_completed(&self, waker: &Waker, token: u16) {
        self.core.on_completed(waker, token)
    }

    fn get_result(&self, token: u16) -> Result<S::Output, TaskError> {
        let result = self.core.get_result(token);
        self.release();
        result
    }

    fn unsafe_status(&self) -> Status {
        self.core.unsafe_status()
    }
}

/// Observes a task taken apart by [`Task::into_parts`].
pub(crate) fn resolve<T>(parts: TaskParts<T>) -> Result<T, TaskError> {
    match parts {
        TaskParts::Ready(result) => result,
        TaskParts::Pending { source, token } => source.get_result(token),
    }
}

struct SlotState<T> {
    input: Option<TaskParts<T>>,
    value: Option<T>,
}

/// One input of a fixed-arity combinator and, once observed, its value.
pub(crate) struct Slot<T>(Mutex<RefCell<SlotState<T>>>);

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self(Mutex::new(RefCell::new(SlotState {
            input: None,
            value: None,
        })))
    }
}

impl<T> Slot<T> {
    pub(crate) fn put(&self, parts: TaskParts<T>) {
        critical_section::with(|cs| {
            self.0.borrow_ref_mut(cs).input = Some(parts)
        });
    }

    /// Observes the input; `None` if it was already observed.
    pub(crate) fn take_result(&self) -> Option<Result<T, TaskError>> {
        let parts =
            critical_section::with(|cs| self.0.borrow_ref_mut(cs).input.take());
        parts.map(resolve)
    }

    /// Observes the input and keeps a successful value for
    /// [`take_value`](Self::take_value).
    pub(crate) fn observe(&self) -> Option<TaskError> {
        match self.take_result()? {
            Ok(value) => {
                critical_section::with(|cs| {
                    self.0.borrow_ref_mut(cs).value = Some(value)
                });
                None
            }
            Err(error) => Some(error),
        }
    }

    pub(crate) fn take_value(&self) -> Option<T> {
        critical_section::with(|cs| self.0.borrow_ref_mut(cs).value.take())
    }

    pub(crate) fn clear(&self) {
        let stale = critical_section::with(|cs| {
            let mut state = self.0.borrow_ref_mut(cs);
            (state.input.take(), state.value.take())
        });
        drop(stale);
    }
}
