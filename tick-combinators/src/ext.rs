use core::time::Duration;

use tick_core::{CancelToken, Task};

use crate::{
    AnyOf2, TimeoutOptions, WhenAll, WhenAny, attach_external_cancellation,
    preserve, suppress_cancel, timeout, timeout_with,
};

/// Method forms of the single-task combinators.
pub trait TaskExt<T>: Sized {
    /// See [`timeout`](crate::timeout).
    fn timeout(self, duration: Duration) -> Task<T>;

    /// See [`timeout_with`](crate::timeout_with).
    fn timeout_with(self, duration: Duration, options: TimeoutOptions)
    -> Task<T>;

    /// See [`preserve`](crate::preserve).
    fn preserve(self) -> Task<T>
    where
        T: Clone;

    /// See
    /// [`attach_external_cancellation`](crate::attach_external_cancellation).
    fn attach_external_cancellation(self, token: CancelToken) -> Task<T>;

    /// See [`suppress_cancel`](crate::suppress_cancel).
    fn suppress_cancel(self) -> Task<Option<T>>;

    /// Waits for both tasks.
    fn along_with<U: Send + 'static>(self, other: Task<U>) -> Task<(T, U)>;

    /// Waits for the first of both tasks.
    fn race_with<U: Send + 'static>(self, other: Task<U>)
    -> Task<AnyOf2<T, U>>;
}

impl<T: Send + 'static> TaskExt<T> for Task<T> {
    #[track_caller]
    fn timeout(self, duration: Duration) -> Task<T> {
        timeout(self, duration)
    }

    #[track_caller]
    fn timeout_with(
        self,
        duration: Duration,
        options: TimeoutOptions,
    ) -> Task<T> {
        timeout_with(self, duration, options)
    }

    fn preserve(self) -> Task<T>
    where
        T: Clone,
    {
        preserve(self)
    }

    #[track_caller]
    fn attach_external_cancellation(self, token: CancelToken) -> Task<T> {
        attach_external_cancellation(self, token)
    }

    #[track_caller]
    fn suppress_cancel(self) -> Task<Option<T>> {
        suppress_cancel(self)
    }

    #[track_caller]
    fn along_with<U: Send + 'static>(self, other: Task<U>) -> Task<(T, U)> {
        (self, other).when_all()
    }

    #[track_caller]
    fn race_with<U: Send + 'static>(
        self,
        other: Task<U>,
    ) -> Task<AnyOf2<T, U>> {
        (self, other).when_any()
    }
}
