//! Unbounded single-consumer queue fed by task continuations.

use core::{
    cell::RefCell,
    task::{Context, Poll},
};
use std::{collections::VecDeque, task::Waker};

use critical_section::Mutex;

struct State<T> {
    queue: VecDeque<T>,
    /// Writes still expected before the channel closes.
    remaining: usize,
    waker: Option<Waker>,
}

pub(crate) struct Channel<T> {
    state: Mutex<RefCell<State<T>>>,
}

impl<T> Channel<T> {
    /// A channel that closes after `writes` sends.
    pub(crate) fn new(writes: usize) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                queue: VecDeque::with_capacity(writes),
                remaining: writes,
                waker: None,
            })),
        }
    }

    pub(crate) fn send(&self, value: T) {
        let waker = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.queue.push_back(value);
            state.remaining = state.remaining.saturating_sub(1);
            state.waker.take()
        });
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Next value, or `None` once every write was received.
    pub(crate) fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if let Some(value) = state.queue.pop_front() {
                return Poll::Ready(Some(value));
            }
            if state.remaining == 0 {
                return Poll::Ready(None);
            }
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        })
    }

    /// Takes whatever was sent but never received.
    pub(crate) fn drain(&self) -> VecDeque<T> {
        critical_section::with(|cs| {
            core::mem::take(&mut self.state.borrow_ref_mut(cs).queue)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        task::Wake,
    };

    use super::*;

    struct CountWakes(AtomicUsize);

    impl Wake for CountWakes {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn closes_after_the_expected_writes() {
        let wakes = Arc::new(CountWakes(AtomicUsize::new(0)));
        let waker = Waker::from(wakes.clone());
        let mut cx = Context::from_waker(&waker);
        let channel = Channel::new(2);

        assert_eq!(channel.poll_recv(&mut cx), Poll::Pending);
        channel.send('a');
        assert_eq!(wakes.0.load(Ordering::SeqCst), 1);
        channel.send('b');

        assert_eq!(channel.poll_recv(&mut cx), Poll::Ready(Some('a')));
        assert_eq!(channel.poll_recv(&mut cx), Poll::Ready(Some('b')));
        assert_eq!(channel.poll_recv(&mut cx), Poll::Ready(None));
    }
}
