use core::{
    cell::RefCell,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use critical_section::Mutex;
use tick_core::{
    CancelSource, Task, TaskError, TimeoutError, report_unhandled,
};
use tick_loop::{DelayType, TickOptions, TickPhase, delay_with};

use crate::promise::{Promise, Settle, Slot};

const TARGET: usize = 0;
const DELAY: usize = 1;
const NONE: usize = usize::MAX;

/// How a [`timeout_with`] measures and reports its deadline.
#[derive(Clone, Default)]
pub struct TimeoutOptions {
    /// Clock the deadline runs on.
    pub kind: DelayType,
    /// Phase whose poll list advances the deadline.
    pub phase: TickPhase,
    /// Tripped when the deadline wins, so the target can stop its own work.
    pub on_timeout: Option<CancelSource>,
}

impl TimeoutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: DelayType) -> Self {
        self.kind = kind;
        self
    }

    pub fn phase(mut self, phase: TickPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn on_timeout(mut self, source: CancelSource) -> Self {
        self.on_timeout = Some(source);
        self
    }
}

/// Races `task` against a `duration` delay on the update phase.
///
/// Fails with a [`TimeoutError`] fault if the delay wins. Otherwise the
/// delay is canceled, so it leaves the poll list on its next advance, and
/// the target's outcome is forwarded.
#[track_caller]
pub fn timeout<T: Send + 'static>(
    task: Task<T>,
    duration: Duration,
) -> Task<T> {
    timeout_with(task, duration, TimeoutOptions::default())
}

/// [`timeout`] with an explicit clock, phase and cancel source.
///
/// When `options.on_timeout` is set, a target that ends up canceled while
/// that source is tripped is reported as a timeout as well.
#[track_caller]
pub fn timeout_with<T: Send + 'static>(
    task: Task<T>,
    duration: Duration,
    options: TimeoutOptions,
) -> Task<T> {
    let delay_source = CancelSource::new();
    let delay = delay_with(
        duration,
        options.kind,
        TickOptions::new()
            .phase(options.phase)
            .token(delay_source.token()),
    );

    let promise = Promise::<Deadline<T>>::rent(2);
    critical_section::with(|cs| {
        promise.state.armed.replace(
            cs,
            Some(Armed {
                delay_source,
                on_timeout: options.on_timeout,
                after: duration,
            }),
        )
    });
    promise.watch(TARGET, task, |parts| promise.state.target.put(parts));
    promise.watch(DELAY, delay, |parts| promise.state.delay.put(parts));
    promise.task()
}

struct Armed {
    delay_source: CancelSource,
    on_timeout: Option<CancelSource>,
    after: Duration,
}

struct Deadline<T> {
    target: Slot<T>,
    delay: Slot<()>,
    armed: Mutex<RefCell<Option<Armed>>>,
    winner: AtomicUsize,
}

impl<T> Default for Deadline<T> {
    fn default() -> Self {
        Self {
            target: Slot::default(),
            delay: Slot::default(),
            armed: Mutex::new(RefCell::new(None)),
            winner: AtomicUsize::new(NONE),
        }
    }
}

impl<T> Deadline<T> {
    /// Claims the race for `index`, handing out the configuration.
    fn claim(&self, index: usize) -> Option<Armed> {
        self.winner
            .compare_exchange(NONE, index, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        critical_section::with(|cs| self.armed.take(cs))
    }
}

impl<T: Send + 'static> Settle for Deadline<T> {
    type Output = T;

    fn settle(&self, index: usize, promise: &Promise<Self>) {
        if index == DELAY {
            if self.delay.take_result().is_none() {
                return;
            }
            // lost: the target won and canceled it
            let Some(armed) = self.claim(DELAY) else { return };
            if let Some(on_timeout) = &armed.on_timeout {
                on_timeout.cancel();
            }
            tracing::trace!(after = ?armed.after, "timeout elapsed");
            promise.core().try_set_error(
                TimeoutError { after: armed.after }.into(),
            );
            return;
        }

        let Some(result) = self.target.take_result() else { return };
        let Some(armed) = self.claim(TARGET) else {
            if let Err(TaskError::Faulted(fault)) = result {
                report_unhandled(&fault);
            }
            return;
        };

        armed.delay_source.cancel();
        let timed_out = armed
            .on_timeout
            .as_ref()
            .is_some_and(CancelSource::is_canceled);
        let result = match result {
            Err(TaskError::Canceled(_)) if timed_out => {
                Err(TimeoutError { after: armed.after }.into())
            }
            result => result,
        };
        promise.core().try_set(result);
    }

    fn clear(&self) {
        self.target.clear();
        self.delay.clear();
        let armed = critical_section::with(|cs| self.armed.take(cs));
        drop(armed);
        self.winner.store(NONE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tick_core::{AutoResetCompletionSource, CancelReason};
    use tick_loop::Runtime;

    use super::*;

    fn runtime() -> Runtime {
        Runtime::builder()
            .fixed_delta(Duration::from_millis(10))
            .build()
    }

    #[test]
    fn never_resolving_target_times_out() {
        let runtime = runtime();
        let _enter = runtime.enter();
        let source = AutoResetCompletionSource::<u8>::create();
        let task = timeout(source.task(), Duration::from_millis(100));

        for _ in 0..9 {
            runtime.drive_all();
            assert!(!task.is_completed());
        }
        assert_eq!(runtime.poll_len(TickPhase::Update), 1);
        runtime.drive_all();
        let error = task.get_result().unwrap_err();
        assert!(error.is_timeout());
        assert_eq!(runtime.poll_len(TickPhase::Update), 0);
    }

    #[test]
    fn target_winning_cancels_the_delay() {
        let runtime = runtime();
        let _enter = runtime.enter();
        let source = AutoResetCompletionSource::<u8>::create();
        let task = timeout(source.task(), Duration::from_secs(5));
        runtime.drive_all();
        assert_eq!(runtime.poll_len(TickPhase::Update), 1);

        source.try_set_result(9);
        assert_eq!(task.get_result().ok(), Some(9));
        runtime.drive_all();
        assert_eq!(runtime.poll_len(TickPhase::Update), 0);
    }

    #[test]
    fn on_timeout_source_is_tripped() {
        let runtime = runtime();
        let _enter = runtime.enter();
        let on_timeout = CancelSource::new();
        let source = AutoResetCompletionSource::<u8>::create();
        let task = timeout_with(
            source.task(),
            Duration::from_millis(20),
            TimeoutOptions::new().on_timeout(on_timeout.clone()),
        );

        let result = runtime.run_until_complete(task, 10);
        assert!(result.is_some_and(|result| result.is_err()));
        assert!(on_timeout.is_canceled());
    }

    #[test]
    fn cancellation_under_a_tripped_source_is_a_timeout() {
        let runtime = runtime();
        let _enter = runtime.enter();
        let on_timeout = CancelSource::new();
        on_timeout.cancel();
        let task = timeout_with(
            Task::<u8>::canceled(CancelReason::Requested),
            Duration::from_secs(1),
            TimeoutOptions::new().on_timeout(on_timeout),
        );
        assert!(task.get_result().unwrap_err().is_timeout());
    }
}
