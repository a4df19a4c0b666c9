//! Time and frame based delays.

use core::{task::Poll, time::Duration};
use std::time::Instant;

use tick_core::{Task, TaskError};

use crate::{
    phase::{TickContext, TickOptions},
    promise::{Advance, PollPromise, cancel_reason},
};

/// Which clock a [`delay_with`] counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DelayType {
    /// Sum of tick deltas, scaled by the runtime's time scale.
    #[default]
    DeltaTime,
    /// Sum of unscaled tick deltas.
    UnscaledDeltaTime,
    /// Wall clock time since the delay was created.
    Realtime,
}

struct DeltaDelay {
    elapsed: Duration,
    duration: Duration,
    scaled: bool,
}

impl Advance for DeltaDelay {
    type Output = ();

    fn advance(
        &mut self,
        cx: &TickContext,
        created_tick: u64,
    ) -> Poll<Result<(), TaskError>> {
        // the tick that created the delay does not count
        if self.elapsed.is_zero() && cx.tick == created_tick {
            return Poll::Pending;
        }
        let delta = if self.scaled {
            cx.delta
        } else {
            cx.unscaled_delta
        };
        self.elapsed = self.elapsed.saturating_add(delta);
        if self.elapsed >= self.duration {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

struct RealtimeDelay {
    started: Instant,
    duration: Duration,
}

impl Advance for RealtimeDelay {
    type Output = ();

    fn advance(
        &mut self,
        cx: &TickContext,
        _: u64,
    ) -> Poll<Result<(), TaskError>> {
        if cx.now.saturating_duration_since(self.started) >= self.duration {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

struct FrameDelay {
    frames: u64,
    counted: u64,
}

impl Advance for FrameDelay {
    type Output = ();

    fn advance(
        &mut self,
        cx: &TickContext,
        created_tick: u64,
    ) -> Poll<Result<(), TaskError>> {
        if cx.tick == created_tick {
            return Poll::Pending;
        }
        self.counted += 1;
        if self.counted >= self.frames {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

struct YieldOnce;

impl Advance for YieldOnce {
    type Output = ();

    fn advance(
        &mut self,
        _: &TickContext,
        _: u64,
    ) -> Poll<Result<(), TaskError>> {
        Poll::Ready(Ok(()))
    }
}

fn completed(options: &TickOptions) -> Task<()> {
    if options.token.is_canceled() {
        Task::canceled(cancel_reason(&options.token))
    } else {
        Task::completed()
    }
}

/// Completes once `duration` of scaled tick time has passed on the
/// [`Update`](crate::TickPhase::Update) phase.
#[track_caller]
pub fn delay(duration: Duration) -> Task<()> {
    delay_with(duration, DelayType::DeltaTime, TickOptions::default())
}

/// Completes once `duration` has passed on the clock chosen by `kind`.
///
/// A zero duration completes immediately. Otherwise the tick the delay is
/// created in never counts towards it.
#[track_caller]
pub fn delay_with(
    duration: Duration,
    kind: DelayType,
    options: TickOptions,
) -> Task<()> {
    if duration.is_zero() {
        return completed(&options);
    }
    match kind {
        DelayType::DeltaTime | DelayType::UnscaledDeltaTime => {
            PollPromise::start(
                DeltaDelay {
                    elapsed: Duration::ZERO,
                    duration,
                    scaled: kind == DelayType::DeltaTime,
                },
                options,
            )
        }
        DelayType::Realtime => PollPromise::start(
            RealtimeDelay {
                started: Instant::now(),
                duration,
            },
            options,
        ),
    }
}

/// Completes on the `frames`-th tick after the current one.
#[track_caller]
pub fn delay_frame(frames: u64) -> Task<()> {
    delay_frame_with(frames, TickOptions::default())
}

#[track_caller]
pub fn delay_frame_with(frames: u64, options: TickOptions) -> Task<()> {
    if frames == 0 {
        return completed(&options);
    }
    PollPromise::start(FrameDelay { frames, counted: 0 }, options)
}

/// Completes on the next tick, never on the one it was created in.
#[track_caller]
pub fn next_frame() -> Task<()> {
    next_frame_with(TickOptions::default())
}

#[track_caller]
pub fn next_frame_with(options: TickOptions) -> Task<()> {
    PollPromise::start(
        FrameDelay {
            frames: 1,
            counted: 0,
        },
        options,
    )
}

/// Completes the first time the poll list is advanced, which may be later
/// in the current tick when called from a continuation.
#[track_caller]
pub fn yield_task() -> Task<()> {
    yield_task_with(TickOptions::default())
}

#[track_caller]
pub fn yield_task_with(options: TickOptions) -> Task<()> {
    PollPromise::start(YieldOnce, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, TickPhase};

    fn runtime(delta_ms: u64) -> Runtime {
        Runtime::builder()
            .fixed_delta(Duration::from_millis(delta_ms))
            .build()
    }

    /// Ticks driven until `task` completed.
    fn ticks_until_done(runtime: &Runtime, task: Task<()>) -> u64 {
        let start = runtime.tick_count(TickPhase::Update);
        let result = runtime.run_until_complete(task, 1_000);
        assert!(matches!(result, Some(Ok(()))), "{result:?}");
        runtime.tick_count(TickPhase::Update) - start
    }

    #[test]
    fn zero_delays_complete_immediately() {
        let runtime = runtime(10);
        let _enter = runtime.enter();
        assert!(delay(Duration::ZERO).is_completed());
        assert!(delay_frame(0).is_completed());
        assert_eq!(runtime.poll_len(TickPhase::Update), 0);
    }

    #[test]
    fn delta_delay_counts_scaled_time() {
        let runtime = runtime(10);
        let _enter = runtime.enter();
        let fifty = Duration::from_millis(50);
        assert_eq!(ticks_until_done(&runtime, delay(fifty)), 5);

        runtime.set_time_scale(2.0);
        assert_eq!(ticks_until_done(&runtime, delay(fifty)), 3);

        let unscaled = delay_with(
            Duration::from_millis(50),
            DelayType::UnscaledDeltaTime,
            TickOptions::default(),
        );
        assert_eq!(ticks_until_done(&runtime, unscaled), 5);
    }

    #[test]
    fn frame_delays_skip_the_creation_tick() {
        let runtime = runtime(1);
        let _enter = runtime.enter();
        assert_eq!(ticks_until_done(&runtime, delay_frame(3)), 3);
        assert_eq!(ticks_until_done(&runtime, next_frame()), 1);
        assert_eq!(ticks_until_done(&runtime, yield_task()), 1);
    }

    #[test]
    fn next_frame_from_a_continuation_waits_a_tick() {
        let runtime = runtime(1);
        let _enter = runtime.enter();
        let slot = std::sync::Arc::new(std::sync::Mutex::new(None));
        let (store, yield_store) = (slot.clone(), slot.clone());
        runtime.post(TickPhase::Update, move || {
            *store.lock().unwrap() = Some((next_frame(), yield_task()));
        });

        runtime.drive_tick(TickPhase::Update);
        let (frame, yielded) = yield_store.lock().unwrap().take().unwrap();
        // same tick: the yield ran in this pass, the frame delay did not
        assert!(yielded.is_completed());
        assert!(!frame.is_completed());
        assert!(yielded.get_result().is_ok());

        runtime.drive_tick(TickPhase::Update);
        assert!(frame.get_result().is_ok());
    }

    #[test]
    fn realtime_delay_uses_the_wall_clock() {
        let runtime = Runtime::builder()
            .fixed_delta(Duration::from_secs(60))
            .build();
        let _enter = runtime.enter();
        let task = delay_with(
            Duration::from_millis(20),
            DelayType::Realtime,
            TickOptions::default(),
        );
        runtime.drive_all();
        assert!(!task.is_completed());

        std::thread::sleep(Duration::from_millis(25));
        runtime.drive_all();
        assert!(task.get_result().is_ok());
    }

    #[test]
    fn cancel_all_cancels_only_older_items() {
        let runtime = runtime(1);
        let _enter = runtime.enter();
        let before = delay_frame(5);
        runtime.cancel_all_in_flight();
        let after = delay_frame(2);

        runtime.drive_all();
        let error = before.get_result().unwrap_err();
        assert_eq!(
            error.cancel_reason(),
            Some(&tick_core::CancelReason::CancelAll)
        );
        assert!(!after.is_completed());
        assert!(matches!(runtime.run_until_complete(after, 5), Some(Ok(()))));
    }

    #[test]
    fn token_cancels_on_next_advance() {
        let runtime = runtime(1);
        let _enter = runtime.enter();
        let source = tick_core::CancelSource::new();
        let task =
            delay_frame_with(10, TickOptions::new().token(source.token()));
        runtime.drive_all();
        source.cancel();
        assert!(!task.is_completed());
        runtime.drive_all();
        assert!(task.get_result().unwrap_err().is_canceled());
        assert_eq!(runtime.poll_len(TickPhase::Update), 0);
    }
}
