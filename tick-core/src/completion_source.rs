use core::{any::type_name, panic::Location};
use std::{
    sync::{Arc, Weak},
    task::Waker,
};

use crate::{
    completion::CompletionCore,
    diagnostics::TrackingSlot,
    error::{CancelReason, Fault, TaskError},
    pooled::{give_back, rent},
    source::{Status, TaskSource},
    task::Task,
};

/// Pooled producer side of a single-await [`Task`].
///
/// The source returns to its pool as soon as its task is consumed. From
/// then until the pool hands it out again every `try_set_*` returns
/// `false`, as does any `try_set_*` after the first. Once a later
/// [`create`](Self::create) has re-armed it, the old producer's `Arc` points
/// at someone else's operation and must not be used any more.
pub struct AutoResetCompletionSource<T> {
    core: CompletionCore<T>,
    tracking: TrackingSlot,
    me: Weak<Self>,
}

impl<T: Send + 'static> AutoResetCompletionSource<T> {
    #[track_caller]
    pub fn create() -> Arc<Self> {
        let source = rent(|me| Self {
            core: CompletionCore::new(),
            tracking: TrackingSlot::new(),
            me: me.clone(),
        });
        source.core.arm();
        source
            .tracking
            .created(type_name::<Self>(), Location::caller());
        source
    }

    /// Handle for the current incarnation.
    pub fn task(self: &Arc<Self>) -> Task<T> {
        Task::from_source(self.clone(), self.core.version())
    }

    #[inline]
    pub fn version(&self) -> u16 {
        self.core.version()
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.core.try_set_result(value)
    }

    pub fn try_set_exception(&self, fault: Fault) -> bool {
        self.core.try_set_exception(fault)
    }

    pub fn try_set_canceled(&self, reason: CancelReason) -> bool {
        self.core.try_set_canceled(reason)
    }

    pub fn try_set_error(&self, error: TaskError) -> bool {
        self.core.try_set_error(error)
    }

    fn try_return(&self) {
        self.tracking.retired();
        self.core.reset();
        give_back(&self.me);
    }
}

impl<T: Send + 'static> TaskSource<T> for AutoResetCompletionSource<T> {
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

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn consumed_source_is_recycled() {
        struct Unique;
        let first = AutoResetCompletionSource::<Unique>::create();
        let addr = Arc::as_ptr(&first);
        let task = first.task();
        first.try_set_result(Unique);
        drop(first);

        assert!(task.get_result().is_ok());

        let second = AutoResetCompletionSource::<Unique>::create();
        assert_eq!(Arc::as_ptr(&second), addr);
        assert_eq!(second.task().status(), Status::Pending);
    }

    #[test]
    fn late_producer_cannot_settle_a_recycled_source() {
        #[derive(Debug, PartialEq)]
        struct Marker(u8);
        let source = AutoResetCompletionSource::<Marker>::create();
        let task = source.task();
        assert!(source.try_set_result(Marker(1)));
        assert_eq!(task.get_result().ok(), Some(Marker(1)));

        assert!(!source.try_set_result(Marker(2)));
        assert!(!source.try_set_error(TaskError::msg("late")));

        let fresh = AutoResetCompletionSource::<Marker>::create();
        let task = fresh.task();
        assert_eq!(task.status(), Status::Pending);
        assert!(fresh.try_set_result(Marker(3)));
        assert_eq!(task.get_result().ok(), Some(Marker(3)));
    }

    #[test]
    fn canceled_outcome_carries_reason() {
        let source = AutoResetCompletionSource::<()>::create();
        let task = source.task();
        source.try_set_canceled(CancelReason::Message("shutdown".into()));
        let error = task.get_result().unwrap_err();
        assert_eq!(
            error.cancel_reason(),
            Some(&CancelReason::Message("shutdown".into()))
        );
    }
}
