use core::{
    cell::RefCell,
    sync::atomic::{AtomicUsize, Ordering},
};

use critical_section::Mutex;
use tick_core::{Task, TaskParts};

use crate::promise::{Promise, Settle, Slot, resolve};

/// Waits for every task to complete.
///
/// Resolves with the outputs in input order, whatever order the inputs
/// complete in. The first input to fail fails the aggregate; the others are
/// still observed so their faults are not reported as unhandled.
pub trait WhenAll {
    /// The resulting output type.
    type Output;

    fn when_all(self) -> Task<Self::Output>;
}

/// Waits for every task of `tasks`, see [`WhenAll`].
///
/// An empty input resolves immediately without renting an aggregate.
#[track_caller]
pub fn when_all<T, I>(tasks: I) -> Task<Vec<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Task<T>>,
    I::IntoIter: ExactSizeIterator,
{
    let tasks = tasks.into_iter();
    let len = tasks.len();
    if len == 0 {
        return Task::from_result(Vec::new());
    }

    let promise = Promise::<AllOf<T>>::rent(len);
    critical_section::with(|cs| {
        let mut inner = promise.state.inner.borrow_ref_mut(cs);
        inner.inputs.resize_with(len, || None);
        inner.values.resize_with(len, || None);
    });
    promise.state.len.store(len, Ordering::Release);

    for (index, task) in tasks.enumerate() {
        promise.watch(index, task, |parts| promise.state.put(index, parts));
    }
    promise.task()
}

impl<T: Send + 'static> WhenAll for Vec<Task<T>> {
    type Output = Vec<T>;

    #[track_caller]
    fn when_all(self) -> Task<Vec<T>> {
        when_all(self)
    }
}

impl<T: Send + 'static, const N: usize> WhenAll for [Task<T>; N] {
    type Output = Vec<T>;

    #[track_caller]
    fn when_all(self) -> Task<Vec<T>> {
        when_all(self)
    }
}

struct AllInner<T> {
    inputs: Vec<Option<TaskParts<T>>>,
    values: Vec<Option<T>>,
}

struct AllOf<T> {
    inner: Mutex<RefCell<AllInner<T>>>,
    completed: AtomicUsize,
    len: AtomicUsize,
}

impl<T> Default for AllOf<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(AllInner {
                inputs: Vec::new(),
                values: Vec::new(),
            })),
            completed: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }
}

impl<T> AllOf<T> {
    fn put(&self, index: usize, parts: TaskParts<T>) {
        critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).inputs[index] = Some(parts)
        });
    }
}

impl<T: Send + 'static> Settle for AllOf<T> {
    type Output = Vec<T>;

    fn settle(&self, index: usize, promise: &Promise<Self>) {
        let parts = critical_section::with(|cs| {
            self.inner.borrow_ref_mut(cs).inputs[index].take()
        });
        let Some(parts) = parts else { return };

        match resolve(parts) {
            Ok(value) => critical_section::with(|cs| {
                self.inner.borrow_ref_mut(cs).values[index] = Some(value)
            }),
            Err(error) => {
                promise.core().try_set_error(error);
            }
        }

        let len = self.len.load(Ordering::Acquire);
        if self.completed.fetch_add(1, Ordering::AcqRel) + 1 != len {
            return;
        }
        let values = critical_section::with(|cs| {
            self.inner
                .borrow_ref_mut(cs)
                .values
                .iter_mut()
                .map(Option::take)
                .collect::<Option<Vec<T>>>()
        });
        if let Some(values) = values {
            promise.core().try_set_result(values);
        }
    }

    fn clear(&self) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.inputs.clear();
            inner.values.clear();
        });
        self.completed.store(0, Ordering::Release);
        self.len.store(0, Ordering::Release);
    }
}

macro_rules! impl_when_all_tuple {
    ($namespace:ident $StateName:ident $($F:ident)+) => {
        mod $namespace {
            #[repr(u8)]
            pub(super) enum Indexes { $($F,)+ }
            pub(super) const LEN: usize = [$(Indexes::$F,)+].len();
        }

        #[allow(non_snake_case)]
        struct $StateName<$($F),+> {
            $($F: Slot<$F>,)+
            completed: AtomicUsize,
        }

        impl<$($F),+> Default for $StateName<$($F),+> {
            fn default() -> Self {
                Self {
                    $($F: Slot::default(),)+
                    completed: AtomicUsize::new(0),
                }
            }
        }

        impl<$($F: Send + 'static),+> Settle for $StateName<$($F),+> {
            type Output = ($($F,)+);

            #[allow(non_snake_case)]
            fn settle(&self, index: usize, promise: &Promise<Self>) {
                $(
                    if index == $namespace::Indexes::$F as usize {
                        if let Some(error) = self.$F.observe() {
                            promise.core().try_set_error(error);
                        }
                    }
                )+

                let completed =
                    self.completed.fetch_add(1, Ordering::AcqRel) + 1;
                if completed != $namespace::LEN {
                    return;
                }
                $(let $F = self.$F.take_value();)+
                if let ($(Some($F),)+) = ($($F,)+) {
                    promise.core().try_set_result(($($F,)+));
                }
            }

            fn clear(&self) {
                $(self.$F.clear();)+
                self.completed.store(0, Ordering::Release);
            }
        }

        impl<$($F: Send + 'static),+> WhenAll for ($(Task<$F>,)+) {
            type Output = ($($F,)+);

            #[allow(non_snake_case)]
            #[track_caller]
            fn when_all(self) -> Task<Self::Output> {
                let ($($F,)+) = self;
                let promise =
                    Promise::<$StateName<$($F),+>>::rent($namespace::LEN);
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

impl_when_all_tuple!(all2 AllOf2 A B);
impl_when_all_tuple!(all3 AllOf3 A B C);
impl_when_all_tuple!(all4 AllOf4 A B C D);
impl_when_all_tuple!(all5 AllOf5 A B C D E);
impl_when_all_tuple!(all6 AllOf6 A B C D E F);
