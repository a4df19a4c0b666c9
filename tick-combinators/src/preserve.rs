use core::cell::RefCell;
use std::{
    sync::Arc,
    task::{Wake, Waker},
};

use critical_section::Mutex;
use tick_core::{
    ProtocolViolation, SourceRef, Status, Task, TaskError, TaskParts,
    TaskSource, protocol_violation,
};

/// Tokens of a memo never change: it is not pooled.
const MEMO_TOKEN: u16 = 0;

enum Memo<T> {
    Pending {
        target: Option<(SourceRef<T>, u16)>,
        waiters: Vec<Waker>,
    },
    Done(Result<T, TaskError>),
}

/// Caches the outcome of a single-await source so it can be read any
/// number of times.
struct MemoSource<T> {
    memo: Mutex<RefCell<Memo<T>>>,
}

impl<T> MemoSource<T> {
    fn check(&self, token: u16) {
        if token != MEMO_TOKEN {
            protocol_violation(ProtocolViolation::TokenMismatch {
                current: MEMO_TOKEN,
                token,
            });
        }
    }
}

impl<T: Send + 'static> Wake for MemoSource<T> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let target = critical_section::with(|cs| {
            match &mut *self.memo.borrow_ref_mut(cs) {
                Memo::Pending { target, .. } => target.take(),
                Memo::Done(_) => None,
            }
        });
        let Some((source, token)) = target else { return };
        let result = source.get_result(token);
        drop(source);

        let waiters = critical_section::with(|cs| {
            match self.memo.replace(cs, Memo::Done(result)) {
                Memo::Pending { waiters, .. } => waiters,
                Memo::Done(_) => Vec::new(),
            }
        });
        for waiter in waiters {
            waiter.wake();
        }
    }
}

impl<T: Clone + Send + 'static> TaskSource<T> for MemoSource<T> {
    #[track_caller]
    fn status(&self, token: u16) -> Status {
        self.check(token);
        self.unsafe_status()
    }

    #[track_caller]
    fn on_completed(&self, waker: &Waker, token: u16) {
        self.check(token);
        let done = critical_section::with(|cs| {
            match &mut *self.memo.borrow_ref_mut(cs) {
                Memo::Pending { waiters, .. } => {
                    waiters.push(waker.clone());
                    false
                }
                Memo::Done(_) => true,
            }
        });
        if done {
            waker.wake_by_ref();
        }
    }

    #[track_caller]
    fn get_result(&self, token: u16) -> Result<T, TaskError> {
        self.check(token);
        critical_section::with(|cs| match &*self.memo.borrow_ref(cs) {
            Memo::Done(result) => Some(result.clone()),
            Memo::Pending { .. } => None,
        })
        .unwrap_or_else(|| protocol_violation(ProtocolViolation::NotCompleted))
    }

    fn unsafe_status(&self) -> Status {
        critical_section::with(|cs| match &*self.memo.borrow_ref(cs) {
            Memo::Pending { .. } => Status::Pending,
            Memo::Done(Ok(_)) => Status::Succeeded,
            Memo::Done(Err(TaskError::Faulted(_))) => Status::Faulted,
            Memo::Done(Err(TaskError::Canceled(_))) => Status::Canceled,
        })
    }
}

/// Makes `task` awaitable more than once.
///
/// The returned handle can be cloned and each clone awaited; every one of
/// them sees the same outcome. The original source is observed exactly once,
/// then released.
pub fn preserve<T: Clone + Send + 'static>(task: Task<T>) -> Task<T> {
    let (source, token) = match task.into_parts() {
        TaskParts::Ready(result) => return Task::from(result),
        TaskParts::Pending { source, token } => (source, token),
    };
    if source.status(token).is_completed() {
        return Task::from(source.get_result(token));
    }

    let memo = Arc::new(MemoSource {
        memo: Mutex::new(RefCell::new(Memo::Pending {
            target: Some((source.clone(), token)),
            waiters: Vec::new(),
        })),
    });
    source.on_completed(&Waker::from(memo.clone()), token);
    Task::from_source(memo, MEMO_TOKEN)
}
