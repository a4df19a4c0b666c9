use core::{cell::UnsafeCell, mem};
use std::task::Waker;

use crate::{
    error::{
        CancelReason, Fault, ProtocolViolation, TaskError, protocol_violation,
    },
    source::Status,
    sync::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, Ordering},
    unhandled::report_unhandled,
};

/// `completed` value of a core parked by [`CompletionCore::reset`]: no
/// producer can win it until [`CompletionCore::arm`] runs.
const RETIRED: u32 = u32::MAX / 2;

/// No continuation registered yet.
const CONTINUATION_EMPTY: u8 = 0;
/// A continuation waits in the slot.
const CONTINUATION_SET: u8 = 1;
/// The producer has claimed the slot; nothing may be installed any more.
const CONTINUATION_FIRED: u8 = 2;

enum Outcome<T> {
    Empty,
    Value(T),
    Error(TaskError),
}

/// Reusable state machine recording the outcome of one operation.
///
/// A core is completed at most once per version by exactly one producer
/// (`try_set_*`, first writer wins) and read by exactly one consumer, which
/// registers at most one continuation and takes the result once. After
/// [`reset`](Self::reset) the version moves on and every call made with an
/// older token panics with a [`ProtocolViolation`]. A reset core also
/// refuses to be completed until it is handed out again with
/// [`arm`](Self::arm), so a late producer cannot settle an idle core.
///
/// # Concurrency
///
/// Producers race on `completed`: only the caller moving it from 0 to 1
/// writes the outcome. The outcome is published through `status`.
/// The continuation slot is a three state machine: the consumer writes the
/// waker and then moves `EMPTY -> SET`, the producer swaps in `FIRED`. Whoever
/// observes the other side second invokes the waker, so it runs exactly once.
pub struct CompletionCore<T> {
    outcome: UnsafeCell<Outcome<T>>,
    status: AtomicU8,
    completed: AtomicU32,
    version: AtomicU16,
    /// Set while a fault sits in `outcome` that nobody has read.
    unobserved: AtomicBool,
    continuation_state: AtomicU8,
    continuation: UnsafeCell<Option<Waker>>,
}

// Safety: `outcome` is written only by the producer that won `completed` and
// read only after `status` publishes it; `continuation` is handed over through
// `continuation_state`.
unsafe impl<T: Send> Send for CompletionCore<T> {}
unsafe impl<T: Send> Sync for CompletionCore<T> {}

impl<T> CompletionCore<T> {
    pub fn new() -> Self {
        Self {
            outcome: UnsafeCell::new(Outcome::Empty),
            status: AtomicU8::new(Status::Pending as u8),
            completed: AtomicU32::new(0),
            version: AtomicU16::new(0),
            unobserved: AtomicBool::new(false),
            continuation_state: AtomicU8::new(CONTINUATION_EMPTY),
            continuation: UnsafeCell::new(None),
        }
    }

    /// Reopens a reset core for its next incarnation.
    ///
    /// Called by whoever takes the core out of its pool, before the first
    /// handle is made.
    pub fn arm(&self) {
        self.completed.store(0, Ordering::Release);
    }

    /// Whether the core accepts a producer: armed and not completed yet.
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.completed.load(Ordering::Acquire) == 0
    }

    /// Token handles must carry to talk to the current incarnation.
    #[inline]
    pub fn version(&self) -> u16 {
        self.version.load(Ordering::Acquire)
    }

    pub fn try_set_result(&self, value: T) -> bool {
        self.try_complete(Outcome::Value(value), Status::Succeeded)
    }

    pub fn try_set_exception(&self, fault: Fault) -> bool {
        self.try_complete(
            Outcome::Error(TaskError::Faulted(fault)),
            Status::Faulted,
        )
    }

    pub fn try_set_canceled(&self, reason: CancelReason) -> bool {
        self.try_complete(
            Outcome::Error(TaskError::Canceled(reason)),
            Status::Canceled,
        )
    }

    pub fn try_set_error(&self, error: TaskError) -> bool {
        let status = match &error {
            TaskError::Canceled(_) => Status::Canceled,
            TaskError::Faulted(_) => Status::Faulted,
        };
        self.try_complete(Outcome::Error(error), status)
    }

    /// Settles the core with `result`.
    pub fn try_set(&self, result: Result<T, TaskError>) -> bool {
        match result {
            Ok(value) => self.try_set_result(value),
            Err(error) => self.try_set_error(error),
        }
    }

    fn try_complete(&self, outcome: Outcome<T>, status: Status) -> bool {
        if self.completed.fetch_add(1, Ordering::AcqRel) != 0 {
            return false;
        }

        // Safety: winning `completed` grants exclusive write access until
        // `status` is published.
        unsafe { *self.outcome.get() = outcome };
        if status == Status::Faulted {
            self.unobserved.store(true, Ordering::Release);
        }
        self.status.store(status as u8, Ordering::Release);

        if self
            .continuation_state
            .swap(CONTINUATION_FIRED, Ordering::AcqRel)
            == CONTINUATION_SET
        {
            // Safety: the consumer finished writing before it published SET
            // and never touches the slot again once SET is observed.
            let waker = unsafe { (*self.continuation.get()).take() };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        true
    }

    #[inline]
    #[track_caller]
    fn validate(&self, token: u16) {
        let current = self.version();
        if current != token {
            protocol_violation(ProtocolViolation::TokenMismatch {
                current,
                token,
            });
        }
    }

    #[track_caller]
    pub fn status(&self, token: u16) -> Status {
        self.validate(token);
        self.unsafe_status()
    }

    #[inline]
    pub fn unsafe_status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Registers `waker` as the continuation, or wakes it right away if the
    /// core has already completed.
    #[track_caller]
    pub fn on_completed(&self, waker: &Waker, token: u16) {
        self.validate(token);

        if self.unsafe_status().is_completed() {
            waker.wake_by_ref();
            return;
        }

        match self.continuation_state.load(Ordering::Acquire) {
            CONTINUATION_SET => {
                protocol_violation(ProtocolViolation::AlreadyAwaiting)
            }
            CONTINUATION_FIRED => {
                waker.wake_by_ref();
                return;
            }
            _ => {}
        }

        // Safety: single consumer, and the producer only reads the slot after
        // observing SET, which is published below.
        unsafe { *self.continuation.get() = Some(waker.clone()) };

        if let Err(actual) = self.continuation_state.compare_exchange(
            CONTINUATION_EMPTY,
            CONTINUATION_SET,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // The producer fired between the load and the exchange, the slot
            // is still ours.
            let waker = unsafe { (*self.continuation.get()).take() };
            if actual == CONTINUATION_SET {
                protocol_violation(ProtocolViolation::AlreadyAwaiting);
            }
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    /// Takes the outcome out of a completed core.
    ///
    /// The caller is expected to [`reset`](Self::reset) the core afterwards
    /// so the token it used goes stale.
    #[track_caller]
    pub fn get_result(&self, token: u16) -> Result<T, TaskError> {
        self.validate(token);
        if !self.unsafe_status().is_completed() {
            protocol_violation(ProtocolViolation::NotCompleted);
        }

        self.unobserved.store(false, Ordering::Release);
        // Safety: `status` is completed, so the producer is done writing.
        match unsafe { mem::replace(&mut *self.outcome.get(), Outcome::Empty) }
        {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(error) => Err(error),
            Outcome::Empty => {
                protocol_violation(ProtocolViolation::AlreadyConsumed)
            }
        }
    }

    /// Clears the core for reuse and bumps its version.
    ///
    /// A fault that was never read is reported to the unhandled sink first.
    /// The core stays closed to producers until [`arm`](Self::arm).
    pub fn reset(&self) {
        self.report_unobserved();
        self.version.fetch_add(1, Ordering::AcqRel);

        // Safety: only the consumer resets, after the producer completed or
        // when the core was never handed out.
        unsafe {
            *self.outcome.get() = Outcome::Empty;
            *self.continuation.get() = None;
        }
        self.status.store(Status::Pending as u8, Ordering::Release);
        self.continuation_state
            .store(CONTINUATION_EMPTY, Ordering::Release);
        self.completed.store(RETIRED, Ordering::Release);
    }

    fn report_unobserved(&self) {
        if !self.unobserved.swap(false, Ordering::AcqRel) {
            return;
        }
        // Safety: `unobserved` is only set after the outcome was written.
        if let Outcome::Error(TaskError::Faulted(fault)) =
            unsafe { &*self.outcome.get() }
        {
            report_unhandled(fault);
        }
    }
}

impl<T> Default for CompletionCore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CompletionCore<T> {
    fn drop(&mut self) {
        self.report_unobserved();
    }
}
