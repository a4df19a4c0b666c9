//! Core of the tick runtime: the completion state machine, the [`Task`]
//! handle and the cancellation signal.
//!
//! A [`Task`] is a `(source, token)` pair. Sources are pooled objects that
//! implement [`TaskSource`] on top of a [`CompletionCore`]; the token is the
//! version the source had when the handle was made, so a handle that outlives
//! its source's reuse is caught instead of reading someone else's result.

pub mod cancel;
pub mod completion;
pub mod completion_source;
pub mod diagnostics;
pub mod error;
pub mod pooled;
pub mod source;
mod sync;
pub mod task;
pub mod unhandled;

pub use cancel::{CancelRegistration, CancelSource, CancelToken};
pub use completion::CompletionCore;
pub use completion_source::AutoResetCompletionSource;
pub use diagnostics::{TaskId, TaskTracker, TrackingSlot, set_task_tracker};
pub use error::{
    CancelReason, Fault, PanicError, ProtocolViolation, TaskError,
    TimeoutError, protocol_violation,
};
pub use source::{SourceRef, Status, TaskSource};
pub use task::{Task, TaskParts};
pub use unhandled::{
    UnhandledSubscription, report_unhandled, subscribe_unhandled,
};
