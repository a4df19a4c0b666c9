//! Passive hooks for an external task inspector.

use core::{
    cell::RefCell,
    panic::Location,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::sync::Arc;

use critical_section::Mutex;

/// Identifies one use of a pooled task object; a recycled object gets a new
/// id each time it is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Observer notified when operations are created and retired.
pub trait TaskTracker: Send + Sync {
    fn on_created(
        &self,
        id: TaskId,
        type_tag: &'static str,
        location: &'static Location<'static>,
    );

    fn on_retired(&self, id: TaskId);
}

static TRACKER: Mutex<RefCell<Option<Arc<dyn TaskTracker>>>> =
    Mutex::new(RefCell::new(None));
static ENABLED: AtomicBool = AtomicBool::new(false);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Installs or removes the tracker.
pub fn set_task_tracker(tracker: Option<Arc<dyn TaskTracker>>) {
    let enabled = tracker.is_some();
    let previous = critical_section::with(|cs| TRACKER.replace(cs, tracker));
    ENABLED.store(enabled, Ordering::Release);
    drop(previous);
}

#[inline]
pub fn is_tracking() -> bool {
    ENABLED.load(Ordering::Acquire)
}

fn tracker() -> Option<Arc<dyn TaskTracker>> {
    critical_section::with(|cs| TRACKER.borrow_ref(cs).clone())
}

/// Per-object slot remembering the id reported at creation, so retirement
/// is reported exactly once.
#[derive(Debug, Default)]
pub struct TrackingSlot(AtomicU64);

impl TrackingSlot {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Reports creation if a tracker is installed.
    pub fn created(
        &self,
        type_tag: &'static str,
        location: &'static Location<'static>,
    ) {
        if !is_tracking() {
            return;
        }
        let Some(tracker) = tracker() else { return };
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        self.0.store(id, Ordering::Release);
        tracker.on_created(TaskId(id), type_tag, location);
    }

    /// Reports retirement of the id recorded by [`created`](Self::created).
    pub fn retired(&self) {
        let id = self.0.swap(0, Ordering::AcqRel);
        if id == 0 {
            return;
        }
        if let Some(tracker) = tracker() {
            tracker.on_retired(TaskId(id));
        }
    }
}

impl Drop for TrackingSlot {
    /// An object dropped while still in use, such as a poll item whose task
    /// was never read, is retired here.
    fn drop(&mut self) {
        self.retired();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct Retirements(StdMutex<Vec<u64>>);

    impl TaskTracker for Retirements {
        fn on_created(
            &self,
            _: TaskId,
            _: &'static str,
            _: &'static Location<'static>,
        ) {
        }

        fn on_retired(&self, id: TaskId) {
            self.0.lock().unwrap().push(id.get());
        }
    }

    #[test]
    fn retires_once_even_when_dropped_unread() {
        let tracker = Arc::new(Retirements::default());
        set_task_tracker(Some(tracker.clone()));

        let read = TrackingSlot::new();
        read.created("read", Location::caller());
        let read_id = read.0.load(Ordering::Acquire);
        read.retired();
        drop(read);

        let dropped = TrackingSlot::new();
        dropped.created("dropped", Location::caller());
        let dropped_id = dropped.0.load(Ordering::Acquire);
        drop(dropped);

        set_task_tracker(None);
        let retired = tracker.0.lock().unwrap();
        assert_eq!(retired.iter().filter(|id| **id == read_id).count(), 1);
        assert_eq!(retired.iter().filter(|id| **id == dropped_id).count(), 1);
    }
}
