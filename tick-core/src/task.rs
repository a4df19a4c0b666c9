use core::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use std::{
    sync::{Arc, Weak},
    task::{Wake, Waker},
};

use critical_section::Mutex;
use slot_pool::pool_of;

use crate::{
    error::{
        CancelReason, Fault, ProtocolViolation, TaskError, protocol_violation,
    },
    source::{SourceRef, Status},
    unhandled::report_unhandled,
};

/// Handle to an operation that completes on some later tick.
///
/// A `Task` is either an inline, already known result (no object behind it
/// at all) or a `(source, token)` pair pointing at a pooled source. It is
/// meant to be consumed once: awaiting it, or calling
/// [`get_result`](Self::get_result), hands the source back to its pool.
/// Awaiting a clone of a consumed handle panics with a token mismatch; use
/// `preserve` from `tick-combinators` to await a result more than once.
#[must_use = "tasks do nothing unless awaited, observed or forgotten"]
pub struct Task<T> {
    repr: Repr<T>,
}

enum Repr<T> {
    /// `None` once the result has been taken.
    Ready(Option<Result<T, TaskError>>),
    Source {
        source: SourceRef<T>,
        token: u16,
        registered: bool,
    },
}

/// A task taken apart, for combinators that drive sources directly.
pub enum TaskParts<T> {
    Ready(Result<T, TaskError>),
    Pending { source: SourceRef<T>, token: u16 },
}

impl<T> Task<T> {
    #[inline]
    pub fn from_result(value: T) -> Self {
        Self {
            repr: Repr::Ready(Some(Ok(value))),
        }
    }

    #[inline]
    pub fn from_error(error: TaskError) -> Self {
        Self {
            repr: Repr::Ready(Some(Err(error))),
        }
    }

    #[inline]
    pub fn canceled(reason: CancelReason) -> Self {
        Self::from_error(TaskError::Canceled(reason))
    }

    #[inline]
    pub fn faulted(fault: Fault) -> Self {
        Self::from_error(TaskError::Faulted(fault))
    }

    #[inline]
    pub fn from_source(source: SourceRef<T>, token: u16) -> Self {
        Self {
            repr: Repr::Source {
                source,
                token,
                registered: false,
            },
        }
    }

    #[inline]
    pub fn from_parts(parts: TaskParts<T>) -> Self {
        match parts {
            TaskParts::Ready(result) => Self {
                repr: Repr::Ready(Some(result)),
            },
            TaskParts::Pending { source, token } => {
                Self::from_source(source, token)
            }
        }
    }

    #[track_caller]
    pub fn status(&self) -> Status {
        match &self.repr {
            Repr::Ready(Some(Ok(_))) => Status::Succeeded,
            Repr::Ready(Some(Err(TaskError::Faulted(_)))) => Status::Faulted,
            Repr::Ready(Some(Err(TaskError::Canceled(_)))) => Status::Canceled,
            Repr::Ready(None) => {
                protocol_violation(ProtocolViolation::AlreadyConsumed)
            }
            Repr::Source { source, token, .. } => source.status(*token),
        }
    }

    #[inline]
    #[track_caller]
    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    /// Registers `waker` to be woken once the task completes.
    ///
    /// Wakes immediately when the result is already known. A task accepts a
    /// single continuation.
    #[track_caller]
    pub fn on_completed(&mut self, waker: &Waker) {
        match &mut self.repr {
            Repr::Ready(_) => waker.wake_by_ref(),
            Repr::Source {
                source,
                token,
                registered,
            } => {
                if *registered {
                    protocol_violation(ProtocolViolation::AlreadyAwaiting);
                }
                *registered = true;
                source.on_completed(waker, *token);
            }
        }
    }

    /// Takes the result out of a completed task.
    ///
    /// Panics with a protocol violation if the task is still pending.
    #[track_caller]
    pub fn get_result(self) -> Result<T, TaskError> {
        match self.repr {
            Repr::Ready(Some(result)) => result,
            Repr::Ready(None) => {
                protocol_violation(ProtocolViolation::AlreadyConsumed)
            }
            Repr::Source { source, token, .. } => source.get_result(token),
        }
    }

    #[track_caller]
    pub fn into_parts(self) -> TaskParts<T> {
        match self.repr {
            Repr::Ready(Some(result)) => TaskParts::Ready(result),
            Repr::Ready(None) => {
                protocol_violation(ProtocolViolation::AlreadyConsumed)
            }
            Repr::Source { source, token, .. } => {
                TaskParts::Pending { source, token }
            }
        }
    }

    /// Lets the task run to completion without awaiting it.
    ///
    /// The outcome is still observed so the source is recycled, and a fault
    /// is sent to the unhandled sink instead of being lost.
    pub fn forget(self)
    where
        T: 'static,
    {
        match self.into_parts() {
            TaskParts::Ready(result) => observe_forgotten(result),
            TaskParts::Pending { source, token } => {
                if source.status(token).is_completed() {
                    observe_forgotten(source.get_result(token));
                    return;
                }
                let slot = pool_of::<ForgetSlot<T>>().pop_or_else(|| {
                    Arc::new_cyclic(|me| ForgetSlot {
                        target: Mutex::new(RefCell::new(None)),
                        me: me.clone(),
                    })
                });
                critical_section::with(|cs| {
                    slot.target.replace(cs, Some((source.clone(), token)))
                });
                source.on_completed(&Waker::from(slot), token);
            }
        }
    }
}

impl Task<()> {
    /// An already succeeded unit task.
    #[inline]
    pub fn completed() -> Self {
        Self::from_result(())
    }
}

fn observe_forgotten<T>(result: Result<T, TaskError>) {
    if let Err(TaskError::Faulted(fault)) = result {
        report_unhandled(&fault);
    }
}

/// Continuation that observes a forgotten task.
struct ForgetSlot<T> {
    target: Mutex<RefCell<Option<(SourceRef<T>, u16)>>>,
    me: Weak<Self>,
}

impl<T: 'static> Wake for ForgetSlot<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let target = critical_section::with(|cs| self.target.take(cs));
        let Some((source, token)) = target else { return };
        observe_forgotten(source.get_result(token));
        drop(source);
        if let Some(me) = self.me.upgrade() {
            pool_of::<ForgetSlot<T>>().try_push(me);
        }
    }
}

impl<T: Clone> Clone for Task<T> {
    /// Copies the handle, not the operation: only one of the copies may be
    /// awaited.
    fn clone(&self) -> Self {
        match &self.repr {
            Repr::Ready(result) => Self {
                repr: Repr::Ready(result.clone()),
            },
            Repr::Source { source, token, .. } => {
                Self::from_source(source.clone(), *token)
            }
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.repr {
            Repr::Ready(Some(Ok(_))) => Some(Status::Succeeded),
            Repr::Ready(Some(Err(TaskError::Faulted(_)))) => {
                Some(Status::Faulted)
            }
            Repr::Ready(Some(Err(TaskError::Canceled(_)))) => {
                Some(Status::Canceled)
            }
            Repr::Ready(None) => None,
            Repr::Source { source, .. } => Some(source.unsafe_status()),
        };
        f.debug_struct("Task").field("status", &status).finish()
    }
}

impl<T> From<Result<T, TaskError>> for Task<T> {
    fn from(result: Result<T, TaskError>) -> Self {
        Self {
            repr: Repr::Ready(Some(result)),
        }
    }
}

// The result is never pinned in place.
impl<T> Unpin for Task<T> {}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (source, token, registered) = match &mut this.repr {
            Repr::Ready(result) => {
                return Poll::Ready(result.take().unwrap_or_else(|| {
                    protocol_violation(ProtocolViolation::AlreadyConsumed)
                }));
            }
            Repr::Source {
                source,
                token,
                registered,
            } => (source, *token, registered),
        };

        if !source.status(token).is_completed() {
            if *registered {
                return Poll::Pending;
            }
            *registered = true;
            source.on_completed(cx.waker(), token);
            if !source.status(token).is_completed() {
                return Poll::Pending;
            }
        }

        let result = source.get_result(token);
        this.repr = Repr::Ready(None);
        Poll::Ready(result)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::{
        completion_source::AutoResetCompletionSource,
        unhandled::subscribe_unhandled,
    };

    fn noop_context<R>(f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        f(&mut cx)
    }

    #[test]
    fn ready_task_resolves_inline() {
        let mut task = Task::from_result(5);
        assert_eq!(task.status(), Status::Succeeded);
        let result = noop_context(|cx| Pin::new(&mut task).poll(cx));
        assert!(matches!(result, Poll::Ready(Ok(5))));
    }

    #[test]
    fn pending_source_resolves_after_completion() {
        let source = AutoResetCompletionSource::<u32>::create();
        let mut task = source.task();

        noop_context(|cx| {
            assert!(Pin::new(&mut task).poll(cx).is_pending());
            // repeated polls do not re-register
            assert!(Pin::new(&mut task).poll(cx).is_pending());
        });

        assert!(source.try_set_result(9));
        let result = noop_context(|cx| Pin::new(&mut task).poll(cx));
        assert!(matches!(result, Poll::Ready(Ok(9))));
    }

    #[test]
    #[should_panic(expected = "token mismatch")]
    fn awaiting_a_consumed_handle_twice_panics() {
        let source = AutoResetCompletionSource::<u32>::create();
        let first = source.task();
        let second = first.clone();
        source.try_set_result(1);

        assert_eq!(first.get_result().ok(), Some(1));
        let _ = second.get_result();
    }

    #[test]
    fn forgotten_fault_is_reported() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = subscribe_unhandled(move |fault| {
            sink.lock().unwrap().push(fault.to_string());
        });

        let source = AutoResetCompletionSource::<u32>::create();
        source.task().forget();
        source.try_set_exception(Fault::msg("task::forgotten"));

        Task::<u32>::faulted(Fault::msg("task::forgotten-inline")).forget();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|m| m == "task::forgotten"));
        assert!(seen.iter().any(|m| m == "task::forgotten-inline"));
    }
}
