use core::{
    cell::RefCell,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use critical_section::Mutex;
use tick_core::{Fault, Task, TaskError, TaskParts, report_unhandled};

use crate::promise::{Promise, Settle, Slot, resolve};

const NONE: usize = usize::MAX;

/// Raised by [`when_any`] over no tasks at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("when_any needs at least one task")]
pub struct EmptyInputError;

/// Waits for the first task to complete.
///
/// The first input to settle, successfully or not, decides the aggregate.
/// The others keep running; their results are observed and dropped, except
/// faults, which go to the unhandled sink.
pub trait WhenAny {
    /// The resulting output type.
    type Output;

    fn when_any(self) -> Task<Self::Output>;
}

/// Waits for the first task of `tasks`, resolving with its index and value.
#[track_caller]
pub fn when_any<T, I>(tasks: I) -> Task<(usize, T)>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
    I::IntoIter: ExactSizeIterator,
{
    let tasks = tasks.into_iter();
    let len = tasks.len();
    if len == 0 {
        return Task::faulted(Fault::new(EmptyInputError));
    }

    let promise = Promise::<AnyOf<T>>::rent(len);
    critical_section::with(|cs| {
        promise
            .state
            .inputs
            .borrow_ref_mut(cs)
            .resize_with(len, || None)
    });
    for (index, task) in tasks.enumerate() {
        promise.watch(index, task, |parts| promise.state.put(index, parts));
    }
    promise.task()
}

impl<T: Send + 'static> WhenAny for Vec<Task<T>> {
    type Output = (usize, T);

    #[track_caller]
    fn when_any(self) -> Task<(usize, T)> {
        when_any(self)
    }
}

impl<T: Send + 'static, const N: usize> WhenAny for [Task<T>; N] {
    type Output = (usize, T);

    #[track_caller]
    fn when_any(self) -> Task<(usize, T)> {
        when_any(self)
    }
}

/// Settles the aggregate with `result` if `index` is the first to get here,
/// and reports the fault of any later loser.
fn race<T, S: Settle>(
    winner: &AtomicUsize,
    index: usize,
    result: Result<T, TaskError>,
    promise: &Promise<S>,
    wrap: impl FnOnce(T) -> S::Output,
) {
    let won = winner
        .compare_exchange(NONE, index, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    if won {
        promise.core().try_set(result.map(wrap));
    } else if let Err(TaskError::Faulted(fault)) = result {
        report_unhandled(&fault);
    }
}

struct AnyOf<T> {
    inputs: Mutex<RefCell<Vec<Option<TaskParts<T>>>>>,
    winner: AtomicUsize,
}

impl<T> Default for AnyOf<T> {
    fn default() -> Self {
        Self {
            inputs: Mutex::new(RefCell::new(Vec::new())),
            winner: AtomicUsize::new(NONE),
        }
    }
}

impl<T> AnyOf<T> {
    fn put(&self, index: usize, parts: TaskParts<T>) {
        critical_section::with(|cs| {
            self.inputs.borrow_ref_mut(cs)[index] = Some(parts)
        });
    }
}

impl<T: Send + 'static> Settle for AnyOf<T> {
    type Output = (usize, T);

    fn settle(&self, index: usize, promise: &Promise<Self>) {
        let parts = critical_section::with(|cs| {
            self.inputs.borrow_ref_mut(cs)[index].take()
        });
        if let Some(parts) = parts {
            race(&self.winner, index, resolve(parts), promise, |value| {
                (index, value)
            });
        }
    }

    fn clear(&self) {
        critical_section::with(|cs| self.inputs.borrow_ref_mut(cs).clear());
        self.winner.store(NONE, Ordering::Release);
    }
}

macro_rules! impl_when_any_tuple {
    ($namespace:ident $StateName:ident $OutputsName:ident $($F:ident)+) => {
        mod $namespace {
            #[repr(u8)]
            pub(super) enum Indexes { $($F,)+ }
        }

        /// Output of the first task to complete, tagged by its position.
        pub enum $OutputsName<$($F,)+> {
            $($F($F),)+
        }

        impl<$($F: fmt::Debug,)+> fmt::Debug for $OutputsName<$($F,)+> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {$(
                    Self::$F(x) =>
                    f.debug_tuple(stringify!($F))
                        .field(x)
                        .finish(),
                )+}
            }
        }

        impl<$($F: PartialEq,)+> PartialEq for $OutputsName<$($F,)+> {
            fn eq(&self, other: &Self) -> bool {
                match (self, other) {
                    $((Self::$F(a), Self::$F(b)) => a == b,)+
                    _ => false
                }
            }
        }

        #[allow(non_snake_case)]
        struct $StateName<$($F),+> {
            $($F: Slot<$F>,)+
            winner: AtomicUsize,
        }

        impl<$($F),+> Default for $StateName<$($F),+> {
            fn default() -> Self {
                Self {
                    $($F: Slot::default(),)+
                    winner: AtomicUsize::new(NONE),
                }
            }
        }

        impl<$($F: Send + 'static),+> Settle for $StateName<$($F),+> {
            type Output = $OutputsName<$($F,)+>;

            fn settle(&self, index: usize, promise: &Promise<Self>) {
                $(
                    if index == $namespace::Indexes::$F as usize {
                        if let Some(result) = self.$F.take_result() {
                            race(
                                &self.winner,
                                index,
                                result,
                                promise,
                                $OutputsName::$F,
                            );
                        }
                    }
                )+
            }

            fn clear(&self) {
                $(self.$F.clear();)+
                self.winner.store(NONE, Ordering::Release);
            }
        }

        impl<$($F: Send + 'static),+> WhenAny for ($(Task<$F>,)+) {
            type Output = $OutputsName<$($F,)+>;

            #[allow(non_snake_case)]
            #[track_caller]
            fn when_any(self) -> Task<Self::Output> {
                let ($($F,)+) = self;
                let promise = Promise::<$StateName<$($F),+>>::rent(
                    [$($namespace::Indexes::$F,)+].len(),
                );
                $(
                    promise.watch(
                        $namespace::Indexes::$F as usize,
                        $F,
                        |parts| promise.state.$F.put(parts),
                    );
                )+
                promise.task()
            }
        }
    };
}

impl_when_any_tuple!(any2 AnyState2 AnyOf2 A B);
impl_when_any_tuple!(any3 AnyState3 AnyOf3 A B C);
impl_when_any_tuple!(any4 AnyState4 AnyOf4 A B C D);
impl_when_any_tuple!(any5 AnyState5 AnyOf5 A B C D E);
impl_when_any_tuple!(any6 AnyState6 AnyOf6 A B C D E F);

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use tick_core::{AutoResetCompletionSource, subscribe_unhandled};

    use super::*;

    fn source<T: Send + 'static>()
    -> (Arc<AutoResetCompletionSource<T>>, Task<T>) {
        let source = AutoResetCompletionSource::create();
        let task = source.task();
        (source, task)
    }

    #[test]
    fn empty_input_faults() {
        let error = when_any(Vec::<Task<u8>>::new()).get_result().unwrap_err();
        assert!(error.fault().is_some_and(Fault::is::<EmptyInputError>));
    }

    #[test]
    fn first_to_settle_wins() {
        let (slow, a) = source::<u32>();
        let (fast, b) = source::<u32>();
        let task = vec![a, b].when_any();

        fast.try_set_result(20);
        slow.try_set_result(10);
        assert_eq!(task.get_result().ok(), Some((1, 20)));
    }

    #[test]
    fn ready_input_wins_synchronously() {
        let (_pending, a) = source::<u8>();
        let task = when_any([a, Task::from_result(7)]);
        assert!(task.is_completed());
        assert_eq!(task.get_result().ok(), Some((1, 7)));
    }

    #[test]
    fn winning_fault_fails_the_aggregate() {
        let (a, first) = source::<u8>();
        let (_b, second) = source::<u8>();
        let task = when_any(vec![first, second]);
        a.try_set_exception(Fault::msg("when_any::winner"));
        let error = task.get_result().unwrap_err();
        assert_eq!(error.to_string(), "when_any::winner");
    }

    #[test]
    fn losing_fault_is_reported() {
        let reported = Arc::new(StdMutex::new(Vec::new()));
        let sink = reported.clone();
        let _subscription = subscribe_unhandled(move |fault| {
            sink.lock().unwrap().push(fault.to_string())
        });

        let (a, first) = source::<u8>();
        let (b, second) = source::<u8>();
        let task = (first, second).when_any();
        a.try_set_result(1);
        assert_eq!(task.get_result().ok(), Some(AnyOf2::A(1)));

        b.try_set_exception(Fault::msg("when_any::loser"));
        assert!(
            reported
                .lock()
                .unwrap()
                .iter()
                .any(|message| message == "when_any::loser")
        );
    }

    #[test]
    fn losing_cancellation_is_quiet() {
        let (a, first) = source::<u8>();
        let (b, second) = source::<&'static str>();
        let task = (first, second).when_any();
        b.try_set_result("b");
        a.try_set_canceled(tick_core::CancelReason::Requested);
        assert_eq!(task.get_result().ok(), Some(AnyOf2::B("b")));
    }
}
