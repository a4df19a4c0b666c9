use core::{
    cell::RefCell,
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};
use std::{
    sync::{Arc, OnceLock},
    task::Waker,
    thread::{self, ThreadId},
    time::Instant,
};

use critical_section::Mutex;
use tick_core::{ProtocolViolation, Task, TaskError, protocol_violation};

use crate::{
    continuation::{Continuation, ContinuationQueue},
    phase::{TickContext, TickPhase},
    poll_list::{PollItemRef, PollList},
};

const DEFAULT_POLL_LIST_CAPACITY: usize = 16;
const DEFAULT_CONTINUATION_CAPACITY: usize = 16;

static DEFAULT: OnceLock<Runtime> = OnceLock::new();

thread_local! {
    static CURRENT: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("the default tick runtime is already initialized")]
    AlreadyInitialized,
}

/// Configuration for a [`Runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    fixed_delta: Option<Duration>,
    time_scale: f64,
    poll_list_capacity: usize,
    continuation_capacity: usize,
    pool_max_size: Option<usize>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            fixed_delta: None,
            time_scale: 1.0,
            poll_list_capacity: DEFAULT_POLL_LIST_CAPACITY,
            continuation_capacity: DEFAULT_CONTINUATION_CAPACITY,
            pool_max_size: None,
        }
    }
}

impl RuntimeBuilder {
    /// Uses `delta` for every [`Runtime::drive_tick`] instead of measuring
    /// wall clock time between ticks.
    pub fn fixed_delta(mut self, delta: Duration) -> Self {
        self.fixed_delta = Some(delta);
        self
    }

    /// Factor applied to the delta seen by `DelayType::DeltaTime` delays.
    pub fn time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    pub fn poll_list_capacity(mut self, capacity: usize) -> Self {
        self.poll_list_capacity = capacity;
        self
    }

    pub fn continuation_capacity(mut self, capacity: usize) -> Self {
        self.continuation_capacity = capacity;
        self
    }

    /// Caps every task object pool, including pools created later.
    pub fn pool_max_size(mut self, max_size: usize) -> Self {
        self.pool_max_size = Some(max_size);
        self
    }

    /// Builds the runtime, recording the calling thread as its main thread.
    pub fn build(self) -> Runtime {
        if let Some(max_size) = self.pool_max_size {
            slot_pool::set_default_max_size(max_size);
        }
        let main_thread = thread::current().id();
        tracing::trace!(
            ?main_thread,
            fixed_delta = ?self.fixed_delta,
            time_scale = self.time_scale,
            "tick runtime built"
        );

        let phase = |phase| PhaseState {
            phase,
            poll_list: PollList::with_capacity(self.poll_list_capacity),
            continuations: ContinuationQueue::with_capacity(
                self.continuation_capacity,
            ),
            driving: AtomicBool::new(false),
            tick: AtomicU64::new(0),
            last_drive: Mutex::new(RefCell::new(None)),
        };

        Runtime {
            inner: Arc::new(Inner {
                main_thread,
                phases: TickPhase::ALL.map(phase),
                cancel_generation: Arc::new(AtomicU64::new(0)),
                time_scale: AtomicU64::new(self.time_scale.to_bits()),
                fixed_delta: self.fixed_delta,
            }),
        }
    }
}

struct PhaseState {
    phase: TickPhase,
    poll_list: PollList,
    continuations: ContinuationQueue,
    driving: AtomicBool,
    tick: AtomicU64,
    last_drive: Mutex<RefCell<Option<Instant>>>,
}

struct Inner {
    main_thread: ThreadId,
    phases: [PhaseState; 2],
    /// Shared with every armed poll promise.
    cancel_generation: Arc<AtomicU64>,
    /// `f64` bits.
    time_scale: AtomicU64,
    fixed_delta: Option<Duration>,
}

/// The tick scheduler: per phase, a poll list and a continuation queue,
/// driven by the host once per tick from the main thread.
///
/// Handles are cheap clones of one shared runtime. Poll items and
/// continuations can be added from any thread.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Builds the process-wide default runtime on the calling thread.
    pub fn init(builder: RuntimeBuilder) -> Result<Runtime, InitError> {
        let mut built = None;
        let runtime = DEFAULT.get_or_init(|| {
            built = Some(());
            builder.build()
        });
        match built {
            Some(()) => Ok(runtime.clone()),
            None => Err(InitError::AlreadyInitialized),
        }
    }

    /// The runtime entered on this thread, else the process default.
    pub fn try_current() -> Option<Runtime> {
        CURRENT
            .with(|current| current.borrow().clone())
            .or_else(|| DEFAULT.get().cloned())
    }

    #[track_caller]
    pub fn current() -> Runtime {
        match Self::try_current() {
            Some(runtime) => runtime,
            None => {
                protocol_violation(ProtocolViolation::RuntimeNotInitialized)
            }
        }
    }

    /// Makes `self` the current runtime of this thread until the guard is
    /// dropped.
    pub fn enter(&self) -> EnterGuard {
        let previous =
            CURRENT.with(|current| current.replace(Some(self.clone())));
        EnterGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.inner.main_thread
    }

    fn phase(&self, phase: TickPhase) -> &PhaseState {
        &self.inner.phases[phase.index()]
    }

    /// Adds an item to `phase`'s poll list.
    ///
    /// Items added while that list is being advanced, or from another thread,
    /// are first advanced on the next pass.
    pub fn add_poll_item(&self, phase: TickPhase, item: PollItemRef) {
        let list = &self.phase(phase).poll_list;
        if self.is_main_thread() {
            // Safety: the main thread is the only one driving the list.
            unsafe { list.add_local(item) };
        } else {
            list.add_deferred(item);
        }
    }

    /// Wakes `waker` at the start of the next tick of `phase`.
    pub fn add_continuation(&self, phase: TickPhase, waker: Waker) {
        self.phase(phase)
            .continuations
            .enqueue(Continuation::Wake(waker));
    }

    /// Runs `f` at the start of the next tick of `phase`.
    pub fn post(&self, phase: TickPhase, f: impl FnOnce() + Send + 'static) {
        self.phase(phase)
            .continuations
            .enqueue(Continuation::Call(Box::new(f)));
    }

    /// Drives one tick of `phase`, measuring its delta from the wall clock
    /// unless the runtime was built with a fixed delta.
    #[track_caller]
    pub fn drive_tick(&self, phase: TickPhase) {
        let delta = match self.inner.fixed_delta {
            Some(delta) => delta,
            None => {
                let now = Instant::now();
                let last = critical_section::with(|cs| {
                    self.phase(phase).last_drive.replace(cs, Some(now))
                });
                last.map_or(Duration::ZERO, |last| now - last)
            }
        };
        self.drive_tick_with_delta(phase, delta);
    }

    /// Drives one tick of `phase`: runs the continuations queued before the
    /// tick, then advances the poll list once.
    ///
    /// Panics with a protocol violation when called off the main thread or
    /// from inside a tick of the same phase.
    #[track_caller]
    pub fn drive_tick_with_delta(&self, phase: TickPhase, delta: Duration) {
        if !self.is_main_thread() {
            protocol_violation(ProtocolViolation::OffMainThread(phase.name()));
        }
        let state = self.phase(phase);
        if state.driving.swap(true, Ordering::AcqRel) {
            protocol_violation(ProtocolViolation::ReentrantDrive(phase.name()));
        }
        let _driving = DrivingGuard(&state.driving);
        let _enter = self.enter();

        let tick = state.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let cx = TickContext {
            phase,
            tick,
            delta: scale_delta(delta, self.time_scale()),
            unscaled_delta: delta,
            now: Instant::now(),
        };
        tracing::trace!(
            phase = state.phase.name(),
            tick,
            poll_len = state.poll_list.len(),
            "tick"
        );

        // Safety: main thread, and `driving` rules out a nested pass.
        unsafe {
            state.continuations.drain();
            state.poll_list.run(&cx);
        }
    }

    /// Drives every phase once in [`TickPhase::ALL`] order.
    #[track_caller]
    pub fn drive_all(&self) {
        for phase in TickPhase::ALL {
            self.drive_tick(phase);
        }
    }

    #[track_caller]
    pub fn drive_all_with_delta(&self, delta: Duration) {
        for phase in TickPhase::ALL {
            self.drive_tick_with_delta(phase, delta);
        }
    }

    /// Drives ticks until `task` completes, at most `max_ticks` rounds.
    ///
    /// Returns `None` if the task is still pending after that.
    #[track_caller]
    pub fn run_until_complete<T>(
        &self,
        task: Task<T>,
        max_ticks: u64,
    ) -> Option<Result<T, TaskError>> {
        for _ in 0..max_ticks {
            if task.is_completed() {
                break;
            }
            self.drive_all();
        }
        if task.is_completed() {
            Some(task.get_result())
        } else {
            None
        }
    }

    /// Number of ticks of `phase` driven so far.
    pub fn tick_count(&self, phase: TickPhase) -> u64 {
        self.phase(phase).tick.load(Ordering::Acquire)
    }

    /// Live items in `phase`'s poll list.
    pub fn poll_len(&self, phase: TickPhase) -> usize {
        self.phase(phase).poll_list.len()
    }

    /// Continuations waiting for the next tick of `phase`.
    pub fn continuation_len(&self, phase: TickPhase) -> usize {
        self.phase(phase).continuations.len()
    }

    pub fn time_scale(&self) -> f64 {
        f64::from_bits(self.inner.time_scale.load(Ordering::Relaxed))
    }

    pub fn set_time_scale(&self, scale: f64) {
        self.inner
            .time_scale
            .store(scale.to_bits(), Ordering::Relaxed);
    }

    pub fn cancel_generation(&self) -> u64 {
        self.inner.cancel_generation.load(Ordering::Acquire)
    }

    /// The live generation counter, read by poll items on every advance.
    pub(crate) fn cancel_signal(&self) -> Arc<AtomicU64> {
        self.inner.cancel_generation.clone()
    }

    /// Cancels every poll item created before this call.
    ///
    /// Items compare the generation they captured at creation with the
    /// live one on each advance, so they settle as canceled on their next
    /// advance, even when that is later in the current pass.
    pub fn cancel_all_in_flight(&self) {
        let generation =
            self.inner.cancel_generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(generation, "cancel generation bumped");
    }
}

/// `delta` scaled by `scale`, saturating. A negative or NaN scale stops
/// scaled time.
fn scale_delta(delta: Duration, scale: f64) -> Duration {
    if delta.is_zero() || scale.is_nan() || scale <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(delta.as_secs_f64() * scale)
        .unwrap_or(Duration::MAX)
}

/// Restores the previously current runtime of this thread on drop.
#[must_use = "the runtime is only current while the guard is alive"]
pub struct EnterGuard {
    previous: Option<Runtime>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

struct DrivingGuard<'a>(&'a AtomicBool);

impl Drop for DrivingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use core::task::Poll;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::poll_list::PollItem;

    fn runtime() -> Runtime {
        Runtime::builder()
            .fixed_delta(Duration::from_millis(10))
            .build()
    }

    struct CountTicks(Arc<AtomicUsize>);

    impl PollItem for CountTicks {
        fn advance(&self, _: &TickContext) -> Poll<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Poll::Pending
        }
    }

    #[test]
    fn phases_tick_independently() {
        let runtime = runtime();
        let hits = Arc::new(AtomicUsize::new(0));
        runtime.add_poll_item(
            TickPhase::FixedUpdate,
            Arc::new(CountTicks(hits.clone())),
        );

        runtime.drive_tick(TickPhase::Update);
        runtime.drive_tick(TickPhase::Update);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.tick_count(TickPhase::Update), 2);

        runtime.drive_tick(TickPhase::FixedUpdate);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.tick_count(TickPhase::FixedUpdate), 1);
        assert_eq!(runtime.poll_len(TickPhase::FixedUpdate), 1);
    }

    #[test]
    fn continuations_run_on_the_next_tick() {
        let runtime = runtime();
        let hits = Arc::new(AtomicUsize::new(0));
        let (requeue, outer) = (runtime.clone(), hits.clone());
        runtime.post(TickPhase::Update, move || {
            outer.fetch_add(1, Ordering::SeqCst);
            let inner = outer.clone();
            requeue.post(TickPhase::Update, move || {
                inner.fetch_add(10, Ordering::SeqCst);
            });
        });

        runtime.drive_tick(TickPhase::Update);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        runtime.drive_tick(TickPhase::Update);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn drive_enters_the_runtime() {
        let runtime = runtime();
        let seen = Arc::new(AtomicBool::new(false));
        let (expected, flag) = (runtime.clone(), seen.clone());
        runtime.post(TickPhase::Update, move || {
            let current = Runtime::current();
            flag.store(
                Arc::ptr_eq(&current.inner, &expected.inner),
                Ordering::SeqCst,
            );
        });
        runtime.drive_tick(TickPhase::Update);
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn enter_guard_restores_previous() {
        let outer = runtime();
        let inner = runtime();
        let _outer = outer.enter();
        {
            let _inner = inner.enter();
            assert!(Arc::ptr_eq(&Runtime::current().inner, &inner.inner));
        }
        assert!(Arc::ptr_eq(&Runtime::current().inner, &outer.inner));
    }

    #[test]
    #[should_panic(expected = "off the runtime's main thread")]
    fn driving_off_the_main_thread_panics() {
        let runtime = runtime();
        let result =
            thread::spawn(move || runtime.drive_tick(TickPhase::Update))
                .join();
        if let Err(payload) = result {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn nested_drive_is_a_protocol_violation() {
        let runtime = runtime();
        let messages = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (nested, sink) = (runtime.clone(), messages.clone());
        let _subscription = tick_core::subscribe_unhandled(move |fault| {
            sink.lock().unwrap().push(fault.to_string());
        });
        runtime.post(TickPhase::Update, move || {
            nested.drive_tick(TickPhase::Update)
        });
        runtime.drive_tick(TickPhase::Update);

        // the continuation's panic is caught by the drain and reported
        assert!(
            messages
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.contains("driven from inside its own pass"))
        );
        // and the phase is usable afterwards
        runtime.drive_tick(TickPhase::Update);
    }

    #[test]
    fn items_added_from_other_threads_are_spliced_in() {
        let runtime = runtime();
        let hits = Arc::new(AtomicUsize::new(0));
        let (remote, counter) = (runtime.clone(), hits.clone());
        thread::spawn(move || {
            remote.add_poll_item(
                TickPhase::Update,
                Arc::new(CountTicks(counter)),
            )
        })
        .join()
        .unwrap();

        assert_eq!(runtime.poll_len(TickPhase::Update), 1);
        runtime.drive_tick(TickPhase::Update);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        runtime.drive_tick(TickPhase::Update);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extreme_time_scales_saturate() {
        let delta = Duration::from_millis(10);
        assert_eq!(scale_delta(delta, 2.0), Duration::from_millis(20));
        assert_eq!(scale_delta(delta, -1.0), Duration::ZERO);
        assert_eq!(scale_delta(delta, f64::NAN), Duration::ZERO);
        assert_eq!(scale_delta(delta, f64::INFINITY), Duration::MAX);
        assert_eq!(scale_delta(Duration::ZERO, f64::INFINITY), Duration::ZERO);

        let runtime = runtime();
        let _enter = runtime.enter();
        runtime.set_time_scale(f64::INFINITY);
        let task = crate::delay(Duration::from_secs(3600));
        runtime.drive_tick(TickPhase::Update);
        runtime.drive_tick(TickPhase::Update);
        assert!(task.get_result().is_ok());
    }

    #[test]
    fn cancel_generation_is_monotonic() {
        let runtime = runtime();
        assert_eq!(runtime.cancel_generation(), 0);
        runtime.cancel_all_in_flight();
        runtime.cancel_all_in_flight();
        assert_eq!(runtime.cancel_generation(), 2);
    }
}
