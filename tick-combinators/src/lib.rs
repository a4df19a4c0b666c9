//! Combinators over [`Task`](tick_core::Task)s.
//!
//! Every aggregate is a pooled object holding one completion core. Each input
//! gets its own continuation, rented from a per-type pool, that reports the
//! input's index back to the aggregate.

mod cancellation;
mod channel;
mod ext;
mod preserve;
mod promise;
mod timeout;
mod wake;
mod when_all;
mod when_any;
mod when_each;

pub use cancellation::{attach_external_cancellation, suppress_cancel};
pub use ext::TaskExt;
pub use preserve::preserve;
pub use timeout::{TimeoutOptions, timeout, timeout_with};
pub use when_all::{WhenAll, when_all};
pub use when_any::{
    AnyOf2, AnyOf3, AnyOf4, AnyOf5, AnyOf6, EmptyInputError, WhenAny, when_any,
};
pub use when_each::{EachItem, EachIter, EachNext, WhenEach, when_each};
