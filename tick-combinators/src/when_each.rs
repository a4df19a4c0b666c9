use core::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
};
use std::sync::Arc;

use critical_section::Mutex;
use tick_core::{
    ProtocolViolation, Task, TaskError, TaskParts, protocol_violation,
    report_unhandled,
};

use crate::{
    channel::Channel,
    promise::resolve,
    wake::{IndexedWake, index_waker},
};

/// An input's index paired with its outcome.
pub type EachItem<T> = (usize, Result<T, TaskError>);

struct EachState<T> {
    inputs: Mutex<RefCell<Vec<Option<TaskParts<T>>>>>,
    channel: Channel<EachItem<T>>,
}

impl<T: Send + 'static> IndexedWake for EachState<T> {
    fn wake_index(&self, index: usize) {
        let parts = critical_section::with(|cs| {
            self.inputs.borrow_ref_mut(cs)[index].take()
        });
        if let Some(parts) = parts {
            self.channel.send((index, resolve(parts)));
        }
    }
}

impl<T> Drop for EachState<T> {
    fn drop(&mut self) {
        for (_, result) in self.channel.drain() {
            if let Err(TaskError::Faulted(fault)) = result {
                report_unhandled(&fault);
            }
        }
    }
}

/// Results of a set of tasks in the order they complete.
///
/// Each result keeps its own outcome: a failing input shows up as an `Err`
/// item instead of ending the sequence. The sequence can be enumerated
/// once. Faults still buffered when it is dropped are reported as
/// unhandled.
pub struct WhenEach<T> {
    state: Arc<EachState<T>>,
    len: usize,
    enumerated: AtomicBool,
}

/// Yields the results of `tasks` as they complete, tagged with their input
/// index.
pub fn when_each<T, I>(tasks: I) -> WhenEach<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
    I::IntoIter: ExactSizeIterator,
{
    let tasks = tasks.into_iter();
    let len = tasks.len();
    let state = Arc::new(EachState {
        inputs: Mutex::new(RefCell::new(
            core::iter::repeat_with(|| None).take(len).collect(),
        )),
        channel: Channel::new(len),
    });

    for (index, task) in tasks.enumerate() {
        let parts = task.into_parts();
        let listen = match &parts {
            TaskParts::Pending { source, token }
                if !source.status(*token).is_completed() =>
            {
                Some((source.clone(), *token))
            }
            _ => None,
        };
        critical_section::with(|cs| {
            state.inputs.borrow_ref_mut(cs)[index] = Some(parts)
        });
        match listen {
            Some((source, token)) => {
                source.on_completed(&index_waker(&state, index), token)
            }
            None => state.wake_index(index),
        }
    }

    WhenEach {
        state,
        len,
        enumerated: AtomicBool::new(false),
    }
}

impl<T> WhenEach<T> {
    /// Number of results the sequence yields.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Starts the enumeration.
    ///
    /// Panics with a protocol violation when called a second time.
    #[track_caller]
    pub fn iter(&self) -> EachIter<T> {
        if self.enumerated.swap(true, Ordering::AcqRel) {
            protocol_violation(ProtocolViolation::AlreadyEnumerated);
        }
        EachIter {
            state: self.state.clone(),
        }
    }
}

/// Consumer side of a [`WhenEach`].
pub struct EachIter<T> {
    state: Arc<EachState<T>>,
}

impl<T> EachIter<T> {
    /// Waits for the next input to complete; `None` once all have.
    pub fn next(&mut self) -> EachNext<'_, T> {
        EachNext { iter: self }
    }

    pub fn poll_next(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<EachItem<T>>> {
        self.state.channel.poll_recv(cx)
    }
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct EachNext<'a, T> {
    iter: &'a mut EachIter<T>,
}

impl<T> Future for EachNext<'_, T> {
    type Output = Option<EachItem<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().iter.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Mutex as StdMutex,
        task::{Context, Waker},
    };

    use tick_core::{AutoResetCompletionSource, Fault, subscribe_unhandled};

    use super::*;

    fn next_now<T>(iter: &mut EachIter<T>) -> Poll<Option<EachItem<T>>> {
        iter.poll_next(&mut Context::from_waker(Waker::noop()))
    }

    #[test]
    fn yields_in_completion_order() {
        let first = AutoResetCompletionSource::<u8>::create();
        let second = AutoResetCompletionSource::<u8>::create();
        let each = when_each(vec![
            first.task(),
            second.task(),
            Task::from_result(0),
        ]);
        let mut iter = each.iter();

        assert!(matches!(next_now(&mut iter), Poll::Ready(Some((2, Ok(0))))));
        assert!(next_now(&mut iter).is_pending());

        second.try_set_exception(Fault::msg("when_each::second"));
        first.try_set_result(1);
        match next_now(&mut iter) {
            Poll::Ready(Some((1, Err(error)))) => {
                assert_eq!(error.to_string(), "when_each::second")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next_now(&mut iter), Poll::Ready(Some((0, Ok(1))))));
        assert!(matches!(next_now(&mut iter), Poll::Ready(None)));
    }

    #[test]
    fn empty_sequence_ends_immediately() {
        let each = when_each(Vec::<Task<()>>::new());
        assert!(each.is_empty());
        assert!(matches!(next_now(&mut each.iter()), Poll::Ready(None)));
    }

    #[test]
    #[should_panic(expected = "enumerated more than once")]
    fn second_enumeration_panics() {
        let each = when_each([Task::from_result(1)]);
        let _first = each.iter();
        let _second = each.iter();
    }

    #[test]
    fn unread_faults_are_reported_on_drop() {
        let reported = Arc::new(StdMutex::new(Vec::new()));
        let sink = reported.clone();
        let _subscription = subscribe_unhandled(move |fault| {
            sink.lock().unwrap().push(fault.to_string())
        });

        let each = when_each([Task::<u8>::faulted(Fault::msg(
            "when_each::unread",
        ))]);
        drop(each);
        assert!(
            reported
                .lock()
                .unwrap()
                .iter()
                .any(|message| message == "when_each::unread")
        );
    }
}
