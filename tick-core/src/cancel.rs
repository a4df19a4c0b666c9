//! Cooperative cancellation signal and its bridge to [`Task`].
//!
//! A [`CancelSource`] trips once; its [`CancelToken`]s can be polled with
//! `is_canceled` or carry callbacks registered with `register`, which run
//! synchronously on the thread that trips the source.

use core::{
    cell::RefCell,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::{
    panic,
    sync::{Arc, Weak},
};

use critical_section::Mutex;

use crate::{
    completion_source::AutoResetCompletionSource,
    error::{CancelReason, Fault},
    task::Task,
    unhandled::report_unhandled,
};

type Callback = Box<dyn FnOnce() + Send>;

struct CancelState {
    canceled: AtomicBool,
    reason: Mutex<RefCell<Option<CancelReason>>>,
    callbacks: Mutex<RefCell<Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
}

/// Owner of a cancellation signal.
#[derive(Clone)]
pub struct CancelSource {
    state: Arc<CancelState>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                canceled: AtomicBool::new(false),
                reason: Mutex::new(RefCell::new(None)),
                callbacks: Mutex::new(RefCell::new(Vec::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(self.state.clone()),
        }
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Requested);
    }

    /// Trips the signal and runs every registered callback.
    ///
    /// Only the first call has any effect. A panicking callback is reported
    /// to the unhandled sink and does not stop the others.
    pub fn cancel_with(&self, reason: CancelReason) {
        let callbacks = critical_section::with(|cs| {
            if self.state.canceled.swap(true, Ordering::AcqRel) {
                return None;
            }
            self.state.reason.replace(cs, Some(reason));
            Some(self.state.callbacks.take(cs))
        });

        let Some(callbacks) = callbacks else { return };
        tracing::trace!(callbacks = callbacks.len(), "cancel source tripped");
        for (_, callback) in callbacks {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(callback))
            {
                report_unhandled(&Fault::from_panic(payload));
            }
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a [`CancelSource`]. The default token never trips.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Option<Arc<CancelState>>,
}

impl CancelToken {
    /// A token that is never canceled.
    pub const fn none() -> Self {
        Self { state: None }
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.canceled.load(Ordering::Acquire))
    }

    #[inline]
    pub fn can_be_canceled(&self) -> bool {
        self.state.is_some()
    }

    /// The reason the source was tripped with, once it has been.
    pub fn reason(&self) -> Option<CancelReason> {
        let state = self.state.as_ref()?;
        critical_section::with(|cs| state.reason.borrow_ref(cs).clone())
    }

    /// Runs `callback` once the token trips, or right away if it already
    /// has. Dropping the returned registration unregisters the callback.
    pub fn register(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> CancelRegistration {
        let Some(state) = &self.state else {
            return CancelRegistration::empty();
        };

        let mut callback = Some(Box::new(callback) as Callback);
        let id = critical_section::with(|cs| {
            if state.canceled.load(Ordering::Acquire) {
                return None;
            }
            let id = state.next_id.fetch_add(1, Ordering::Relaxed);
            if let Some(callback) = callback.take() {
                state.callbacks.borrow_ref_mut(cs).push((id, callback));
            }
            Some(id)
        });

        match (id, callback) {
            (Some(id), _) => CancelRegistration {
                state: Arc::downgrade(state),
                id,
            },
            (None, Some(callback)) => {
                callback();
                CancelRegistration::empty()
            }
            (None, None) => CancelRegistration::empty(),
        }
    }

    /// Bridges the token into a task that completes as canceled when the
    /// token trips.
    ///
    /// Keep the registration alive for as long as the task may still be
    /// awaited; dropping it detaches the task from the token.
    #[track_caller]
    pub fn to_task(&self) -> (Task<()>, CancelRegistration) {
        self.bridge(true)
    }

    /// Like [`to_task`](Self::to_task) but the task succeeds when the token
    /// trips.
    #[track_caller]
    pub fn wait_until_canceled(&self) -> (Task<()>, CancelRegistration) {
        self.bridge(false)
    }

    #[track_caller]
    fn bridge(&self, as_canceled: bool) -> (Task<()>, CancelRegistration) {
        if self.is_canceled() {
            let task = if as_canceled {
                Task::canceled(self.reason().unwrap_or(CancelReason::Requested))
            } else {
                Task::completed()
            };
            return (task, CancelRegistration::empty());
        }

        let source = AutoResetCompletionSource::<()>::create();
        let task = source.task();
        let version = source.version();
        let token = self.clone();
        let registration = self.register(move || {
            // the source may have been recycled since
            if source.version() != version {
                return;
            }
            if as_canceled {
                source.try_set_canceled(
                    token.reason().unwrap_or(CancelReason::Requested),
                );
            } else {
                source.try_set_result(());
            }
        });
        (task, registration)
    }
}

/// Handle to a registered cancel callback; dropping it unregisters.
#[must_use = "the callback is unregistered when this is dropped"]
pub struct CancelRegistration {
    state: Weak<CancelState>,
    id: u64,
}

impl CancelRegistration {
    pub fn empty() -> Self {
        Self {
            state: Weak::new(),
            id: 0,
        }
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        let Some(state) = self.state.upgrade() else { return };
        let removed = critical_section::with(|cs| {
            let mut callbacks = state.callbacks.borrow_ref_mut(cs);
            callbacks
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| callbacks.remove(index))
        });
        drop(removed);
    }
}
