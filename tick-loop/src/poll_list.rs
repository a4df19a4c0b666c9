//! The compacting list of items advanced once per tick.

use core::{
    cell::{RefCell, UnsafeCell},
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    task::Poll,
};
use std::{panic, sync::Arc};

use critical_section::Mutex;
use tick_core::{Fault, report_unhandled};

use crate::phase::TickContext;

/// An operation re-examined every tick until it resolves.
pub trait PollItem: Send + Sync {
    /// Advances the item by one tick.
    ///
    /// Returning `Ready` removes the item from the list. A panic is reported
    /// to the unhandled-fault sink and also removes it.
    fn advance(&self, cx: &TickContext) -> Poll<()>;
}

pub type PollItemRef = Arc<dyn PollItem>;

/// Slots of live items plus a logical tail.
///
/// `slots` and `tail` belong to the thread driving the phase. Everything else
/// goes through `incoming`, which is spliced in after each pass.
pub(crate) struct PollList {
    slots: UnsafeCell<Vec<Option<PollItemRef>>>,
    tail: UnsafeCell<usize>,
    running: AtomicBool,
    incoming: Mutex<RefCell<Vec<PollItemRef>>>,
    len: AtomicUsize,
}

// Safety: `slots` and `tail` are only touched through the `unsafe fn`s below,
// whose callers guarantee they run on the single driving thread.
unsafe impl Send for PollList {}
unsafe impl Sync for PollList {}

impl PollList {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(capacity.max(1), || None);
        Self {
            slots: UnsafeCell::new(slots),
            tail: UnsafeCell::new(0),
            running: AtomicBool::new(false),
            incoming: Mutex::new(RefCell::new(Vec::new())),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of live items, including those waiting to be spliced in.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Queues `item` to be spliced in after the current or next pass.
    pub(crate) fn add_deferred(&self, item: PollItemRef) {
        self.len.fetch_add(1, Ordering::AcqRel);
        critical_section::with(|cs| {
            self.incoming.borrow_ref_mut(cs).push(item)
        });
    }

    /// Appends `item`, or defers it if a pass is running.
    ///
    /// # Safety
    ///
    /// Must be called on the thread that drives this list.
    pub(crate) unsafe fn add_local(&self, item: PollItemRef) {
        if self.running.load(Ordering::Acquire) {
            self.add_deferred(item);
            return;
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        // Safety: driving thread, no pass borrows the slots.
        unsafe { self.push_slot(item) };
    }

    /// Safety: driving thread, outside a pass.
    unsafe fn push_slot(&self, item: PollItemRef) {
        let slots = unsafe { &mut *self.slots.get() };
        let tail = unsafe { &mut *self.tail.get() };
        if *tail == slots.len() {
            let grown = slots.len() * 2;
            slots.resize_with(grown, || None);
        }
        slots[*tail] = Some(item);
        *tail += 1;
    }

    /// Advances every item once, compacting finished slots from the tail,
    /// then splices in the items added meanwhile.
    ///
    /// Items moved in from the tail are advanced before they are moved, so
    /// each live item is advanced exactly once per pass. Relative order is not
    /// preserved.
    ///
    /// # Safety
    ///
    /// Must be called on the thread that drives this list, and not from
    /// inside another pass over it.
    pub(crate) unsafe fn run(&self, cx: &TickContext) {
        self.running.store(true, Ordering::Release);
        let removed = {
            // Safety: only the driving thread reaches the slots, and
            // `add_local` defers while `running` is set.
            let slots = unsafe { &mut *self.slots.get() };
            let tail = unsafe { &mut *self.tail.get() };
            let before = *tail;
            *tail = compact(&mut slots[..before], cx);
            before - *tail
        };
        self.running.store(false, Ordering::Release);
        self.len.fetch_sub(removed, Ordering::AcqRel);

        let incoming = critical_section::with(|cs| self.incoming.take(cs));
        for item in incoming {
            // Safety: pass finished.
            unsafe { self.push_slot(item) };
        }
    }
}

/// Returns the new logical tail.
fn compact(slots: &mut [Option<PollItemRef>], cx: &TickContext) -> usize {
    // `end` is exclusive; slots past it hold nothing live
    let mut end = slots.len();
    let mut i = 0;

    'slots: while i < end {
        if let Some(item) = &slots[i] {
            if advance(item, cx).is_pending() {
                i += 1;
                continue;
            }
            slots[i] = None;
        }

        // backfill slot `i` with the last item that is still pending
        while i + 1 < end {
            end -= 1;
            let Some(from_tail) = slots[end].take() else { continue };
            if advance(&from_tail, cx).is_pending() {
                slots[i] = Some(from_tail);
                i += 1;
                continue 'slots;
            }
        }
        return i;
    }
    i
}

fn advance(item: &PollItemRef, cx: &TickContext) -> Poll<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| item.advance(cx))) {
        Ok(poll) => poll,
        Err(payload) => {
            report_unhandled(&Fault::from_panic(payload));
            Poll::Ready(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Mutex as StdMutex, Weak},
        time::{Duration, Instant},
    };

    use super::*;
    use crate::phase::TickPhase;

    fn cx(tick: u64) -> TickContext {
        TickContext {
            phase: TickPhase::Update,
            tick,
            delta: Duration::ZERO,
            unscaled_delta: Duration::ZERO,
            now: Instant::now(),
        }
    }

    /// Finishes after `remaining` advances and logs each advance.
    struct Countdown {
        name: u32,
        remaining: AtomicUsize,
        log: Arc<StdMutex<Vec<u32>>>,
    }

    impl PollItem for Countdown {
        fn advance(&self, _: &TickContext) -> Poll<()> {
            self.log.lock().unwrap().push(self.name);
            if self.remaining.fetch_sub(1, Ordering::SeqCst) <= 1 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }
    }

    fn countdown(
        name: u32,
        remaining: usize,
        log: &Arc<StdMutex<Vec<u32>>>,
    ) -> PollItemRef {
        Arc::new(Countdown {
            name,
            remaining: AtomicUsize::new(remaining),
            log: log.clone(),
        })
    }

    #[test]
    fn finished_slots_are_backfilled_from_the_tail() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let list = PollList::with_capacity(4);
        unsafe {
            list.add_local(countdown(0, 1, &log));
            list.add_local(countdown(1, 3, &log));
            list.add_local(countdown(2, 1, &log));
            list.add_local(countdown(3, 3, &log));
            list.run(&cx(1));
        }

        // every item advanced exactly once, item 3 moved into slot 0
        let mut first = log.lock().unwrap().clone();
        first.sort_unstable();
        assert_eq!(first, vec![0, 1, 2, 3]);
        assert_eq!(list.len(), 2);
        assert_eq!(unsafe { *list.tail.get() }, 2);

        log.lock().unwrap().clear();
        unsafe {
            list.run(&cx(2));
            list.run(&cx(3));
        }
        assert_eq!(list.len(), 0);
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let list = PollList::with_capacity(1);
        unsafe {
            for name in 0..5 {
                list.add_local(countdown(name, 2, &log));
            }
            list.run(&cx(1));
        }
        assert_eq!(list.len(), 5);
        unsafe { list.run(&cx(2)) };
        assert_eq!(list.len(), 0);
    }

    /// Adds a child item to its own list the first time it is advanced.
    struct Spawner {
        list: Weak<PollList>,
        child: StdMutex<Option<PollItemRef>>,
    }

    impl PollItem for Spawner {
        fn advance(&self, _: &TickContext) -> Poll<()> {
            if let (Some(list), Some(child)) =
                (self.list.upgrade(), self.child.lock().unwrap().take())
            {
                unsafe { list.add_local(child) };
            }
            Poll::Ready(())
        }
    }

    #[test]
    fn items_added_during_a_pass_wait_for_the_next_one() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let list = Arc::new(PollList::with_capacity(4));
        let spawner = Arc::new(Spawner {
            list: Arc::downgrade(&list),
            child: StdMutex::new(Some(countdown(7, 1, &log))),
        });

        unsafe {
            list.add_local(spawner);
            list.run(&cx(1));
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(list.len(), 1);

        unsafe { list.run(&cx(2)) };
        assert_eq!(*log.lock().unwrap(), vec![7]);
        assert_eq!(list.len(), 0);
    }

    struct Panics;

    impl PollItem for Panics {
        fn advance(&self, _: &TickContext) -> Poll<()> {
            panic!("poll_list::panicking-item");
        }
    }

    #[test]
    fn panicking_item_is_reported_and_removed() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = tick_core::subscribe_unhandled(move |fault| {
            sink.lock().unwrap().push(fault.to_string());
        });

        let log = Arc::new(StdMutex::new(Vec::new()));
        let list = PollList::with_capacity(2);
        unsafe {
            list.add_local(Arc::new(Panics));
            list.add_local(countdown(1, 2, &log));
            list.run(&cx(1));
        }

        assert_eq!(list.len(), 1);
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|m| m.contains("poll_list::panicking-item"))
        );
    }
}
