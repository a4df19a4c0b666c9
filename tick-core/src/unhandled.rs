//! Process-wide sink for faults nobody observed.
//!
//! A fault lands here when the core holding it is reset or dropped before
//! anyone read it, when a fire-and-forget task faults, or when a combinator
//! has to drop a loser's fault. Without subscribers the fault is logged at
//! `error` level.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicU64, Ordering},
};
use std::sync::Arc;

use critical_section::Mutex;

use crate::error::Fault;

type Handler = Arc<dyn Fn(&Fault) + Send + Sync>;

static SUBSCRIBERS: Mutex<RefCell<Vec<(u64, Handler)>>> =
    Mutex::new(RefCell::new(Vec::new()));
static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Keeps a handler subscribed until dropped.
#[must_use = "the handler is unsubscribed when this guard is dropped"]
pub struct UnhandledSubscription {
    id: u64,
}

impl Drop for UnhandledSubscription {
    fn drop(&mut self) {
        let removed = critical_section::with(|cs| {
            let mut subscribers = SUBSCRIBERS.borrow_ref_mut(cs);
            subscribers
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| subscribers.remove(index))
        });
        drop(removed);
    }
}

/// Subscribes `handler` to every unobserved fault.
pub fn subscribe_unhandled(
    handler: impl Fn(&Fault) + Send + Sync + 'static,
) -> UnhandledSubscription {
    let id = NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed);
    critical_section::with(|cs| {
        SUBSCRIBERS
            .borrow_ref_mut(cs)
            .push((id, Arc::new(handler)));
    });
    UnhandledSubscription { id }
}

/// Publishes `fault` to the subscribers, or logs it if there are none.
pub fn report_unhandled(fault: &Fault) {
    // handlers run outside the critical section
    let handlers: Vec<Handler> = critical_section::with(|cs| {
        SUBSCRIBERS
            .borrow_ref(cs)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    });

    if handlers.is_empty() {
        tracing::error!(%fault, "unobserved task fault");
        return;
    }
    for handler in handlers {
        handler(fault);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn subscribers_receive_until_dropped() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = subscribe_unhandled(move |fault| {
            sink.lock().unwrap().push(fault.to_string());
        });

        report_unhandled(&Fault::msg("unhandled::first"));
        drop(subscription);
        report_unhandled(&Fault::msg("unhandled::second"));

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|m| m == "unhandled::first"));
        assert!(!seen.iter().any(|m| m == "unhandled::second"));
    }
}
