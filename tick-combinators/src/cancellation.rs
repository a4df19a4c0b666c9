//! Adapters between tasks and cancel tokens.

use core::cell::RefCell;

use critical_section::Mutex;
use tick_core::{
    CancelReason, CancelRegistration, CancelToken, Task, TaskError,
    TaskParts, report_unhandled,
};

use crate::promise::{Promise, Settle, Slot};

/// Completes as canceled as soon as `token` trips, without waiting for
/// `task`.
///
/// The task itself is not stopped. Its result is observed once it arrives;
/// a fault raised after the token won goes to the unhandled sink.
#[track_caller]
pub fn attach_external_cancellation<T: Send + 'static>(
    task: Task<T>,
    token: CancelToken,
) -> Task<T> {
    if !token.can_be_canceled() {
        return task;
    }
    if token.is_canceled() {
        task.forget();
        return Task::canceled(reason(&token));
    }

    let promise = Promise::<Attached<T>>::rent(1);
    let version = promise.core().version();
    let registration = {
        let promise = promise.clone();
        let trigger = token.clone();
        token.register(move || {
            // the promise may have been recycled since
            if promise.core().version() == version {
                promise.core().try_set_canceled(reason(&trigger));
            }
        })
    };
    critical_section::with(|cs| {
        promise.state.registration.replace(cs, Some(registration))
    });
    promise.watch(0, task, |parts| promise.state.target.put(parts));
    promise.task()
}

fn reason(token: &CancelToken) -> CancelReason {
    token.reason().unwrap_or(CancelReason::Requested)
}

struct Attached<T> {
    target: Slot<T>,
    registration: Mutex<RefCell<Option<CancelRegistration>>>,
}

impl<T> Default for Attached<T> {
    fn default() -> Self {
        Self {
            target: Slot::default(),
            registration: Mutex::new(RefCell::new(None)),
        }
    }
}

impl<T: Send + 'static> Settle for Attached<T> {
    type Output = T;

    fn settle(&self, _: usize, promise: &Promise<Self>) {
        let registration =
            critical_section::with(|cs| self.registration.take(cs));
        drop(registration);

        let Some(result) = self.target.take_result() else { return };
        let fault = match &result {
            Err(TaskError::Faulted(fault)) => Some(fault.clone()),
            _ => None,
        };
        if !promise.core().try_set(result) {
            if let Some(fault) = fault {
                report_unhandled(&fault);
            }
        }
    }

    fn clear(&self) {
        self.target.clear();
        let registration =
            critical_section::with(|cs| self.registration.take(cs));
        drop(registration);
    }
}

/// Turns cancellation into `None`; values and faults pass through.
#[track_caller]
pub fn suppress_cancel<T: Send + 'static>(task: Task<T>) -> Task<Option<T>> {
    let parts = task.into_parts();
    if let TaskParts::Ready(result) = parts {
        return Task::from(suppressed(result));
    }

    let promise = Promise::<Suppressed<T>>::rent(1);
    promise.watch(0, Task::from_parts(parts), |parts| {
        promise.state.target.put(parts)
    });
    promise.task()
}

fn suppressed<T>(
    result: Result<T, TaskError>,
) -> Result<Option<T>, TaskError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(TaskError::Canceled(_)) => Ok(None),
        Err(error) => Err(error),
    }
}

struct Suppressed<T> {
    target: Slot<T>,
}

impl<T> Default for Suppressed<T> {
    fn default() -> Self {
        Self {
            target: Slot::default(),
        }
    }
}

impl<T: Send + 'static> Settle for Suppressed<T> {
    type Output = Option<T>;

    fn settle(&self, _: usize, promise: &Promise<Self>) {
        if let Some(result) = self.target.take_result() {
            promise.core().try_set(suppressed(result));
        }
    }

    fn clear(&self) {
        self.target.clear();
    }
}
