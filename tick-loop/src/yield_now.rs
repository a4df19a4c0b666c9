use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{phase::TickPhase, runtime::Runtime};

/// Parks the awaiting task on the continuation queue until the next tick.
///
/// Unlike [`yield_task`](crate::yield_task) nothing is pooled or added to
/// the poll list: the waker itself is the continuation.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    runtime: Runtime,
    phase: TickPhase,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        this.runtime.add_continuation(this.phase, cx.waker().clone());
        Poll::Pending
    }
}

/// Yields to the next [`Update`](TickPhase::Update) tick.
#[track_caller]
pub fn yield_now() -> YieldNow {
    yield_now_in(TickPhase::Update)
}

#[track_caller]
pub fn yield_now_in(phase: TickPhase) -> YieldNow {
    YieldNow {
        runtime: Runtime::current(),
        phase,
        yielded: false,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        task::{Wake, Waker},
    };

    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountWakes(AtomicUsize);

    impl Wake for CountWakes {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wakes_on_the_next_tick() {
        let runtime = Runtime::builder().build();
        let _enter = runtime.enter();
        let wakes = Arc::new(CountWakes(AtomicUsize::new(0)));
        let waker = Waker::from(wakes.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future = yield_now();
        assert!(Pin::new(&mut future).poll(&mut cx).is_pending());
        assert_eq!(runtime.continuation_len(TickPhase::Update), 1);
        assert_eq!(wakes.0.load(Ordering::SeqCst), 0);

        runtime.drive_tick(TickPhase::Update);
        assert_eq!(wakes.0.load(Ordering::SeqCst), 1);
        assert!(Pin::new(&mut future).poll(&mut cx).is_ready());
    }
}
