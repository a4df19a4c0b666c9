//! Predicate driven waits, checked once per tick.

use core::{panic::AssertUnwindSafe, task::Poll};
use std::panic;

use tick_core::{Fault, Task, TaskError};

use crate::{
    phase::{TickContext, TickOptions},
    promise::{Advance, PollPromise},
};

struct WaitUntil<F> {
    predicate: F,
    /// Completes when the predicate returns this.
    expect: bool,
}

impl<F> Advance for WaitUntil<F>
where
    F: FnMut() -> bool + Send + 'static,
{
    type Output = ();

    fn advance(
        &mut self,
        _: &TickContext,
        _: u64,
    ) -> Poll<Result<(), TaskError>> {
        if (self.predicate)() == self.expect {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

struct ValueChanged<F, U> {
    monitor: F,
    current: U,
}

impl<F, U> Advance for ValueChanged<F, U>
where
    F: FnMut() -> U + Send + 'static,
    U: PartialEq + Send + 'static,
{
    type Output = U;

    fn advance(
        &mut self,
        _: &TickContext,
        _: u64,
    ) -> Poll<Result<U, TaskError>> {
        let value = (self.monitor)();
        if value != self.current {
            Poll::Ready(Ok(value))
        } else {
            Poll::Pending
        }
    }
}

/// Completes on the first tick `predicate` returns `true`.
///
/// A panic inside the predicate faults the task.
#[track_caller]
pub fn wait_until<F>(predicate: F) -> Task<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    wait_until_with(predicate, TickOptions::default())
}

#[track_caller]
pub fn wait_until_with<F>(predicate: F, options: TickOptions) -> Task<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    PollPromise::start(
        WaitUntil {
            predicate,
            expect: true,
        },
        options,
    )
}

/// Completes on the first tick `predicate` returns `false`.
#[track_caller]
pub fn wait_while<F>(predicate: F) -> Task<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    wait_while_with(predicate, TickOptions::default())
}

#[track_caller]
pub fn wait_while_with<F>(predicate: F, options: TickOptions) -> Task<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    PollPromise::start(
        WaitUntil {
            predicate,
            expect: false,
        },
        options,
    )
}

/// Samples `monitor` now and completes with the first later sample that
/// differs from it.
#[track_caller]
pub fn wait_until_value_changed<F, U>(monitor: F) -> Task<U>
where
    F: FnMut() -> U + Send + 'static,
    U: PartialEq + Send + 'static,
{
    wait_until_value_changed_with(monitor, TickOptions::default())
}

#[track_caller]
pub fn wait_until_value_changed_with<F, U>(
    mut monitor: F,
    options: TickOptions,
) -> Task<U>
where
    F: FnMut() -> U + Send + 'static,
    U: PartialEq + Send + 'static,
{
    match panic::catch_unwind(AssertUnwindSafe(&mut monitor)) {
        Ok(current) => {
            PollPromise::start(ValueChanged { monitor, current }, options)
        }
        Err(payload) => Task::faulted(Fault::from_panic(payload)),
    }
}
