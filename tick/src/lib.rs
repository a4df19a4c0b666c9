//! A pooled, tick-driven cooperative task runtime.
//!
//! Operations are [`Task`]s: handles to pooled completion sources that are
//! recycled as soon as their result is read. Time based operations live in
//! the poll list of a [`TickPhase`] and are advanced once per
//! [`Runtime::drive_tick`]; everything else completes through continuations.
//!
//! ```rust,ignore
//! let runtime = Runtime::init(Runtime::builder())?;
//!
//! #[async_task]
//! async fn blink() -> Result<u32, TaskError> {
//!     delay(Duration::from_millis(250)).await?;
//!     (next_frame(), delay_frame(3)).when_all().await?;
//!     Ok(Runtime::current().tick_count(TickPhase::Update) as u32)
//! }
//!
//! let task = blink();
//! loop {
//!     runtime.drive_tick(TickPhase::Update);
//!     runtime.drive_tick(TickPhase::FixedUpdate);
//! }
//! ```

pub use slot_pool::{PoolSize, pool_sizes};
pub use tick_combinators::{
    AnyOf2, AnyOf3, AnyOf4, AnyOf5, AnyOf6, EachItem, EachIter, EachNext,
    EmptyInputError, TaskExt, TimeoutOptions, WhenAll, WhenAny, WhenEach,
    attach_external_cancellation, preserve, suppress_cancel, timeout,
    timeout_with, when_all, when_any, when_each,
};
pub use tick_compat::spawn;
pub use tick_core::{
    AutoResetCompletionSource, CancelReason, CancelRegistration,
    CancelSource, CancelToken, CompletionCore, Fault, PanicError,
    ProtocolViolation, SourceRef, Status, Task, TaskError, TaskId, TaskParts,
    TaskSource, TaskTracker, TimeoutError, UnhandledSubscription,
    report_unhandled, set_task_tracker, subscribe_unhandled,
};
pub use tick_derive::async_task;
pub use tick_loop::{
    DelayType, EnterGuard, InitError, PollItem, PollItemRef, Runtime,
    RuntimeBuilder, TickContext, TickOptions, TickPhase, YieldNow, delay,
    delay_frame, delay_frame_with, delay_with, next_frame, next_frame_with,
    wait_until, wait_until_value_changed, wait_until_value_changed_with,
    wait_until_with, wait_while, wait_while_with, yield_now, yield_now_in,
    yield_task, yield_task_with,
};

/// Extension pieces in scope for everyday use.
pub mod prelude {
    pub use crate::{
        CancelSource, CancelToken, Runtime, Task, TaskError, TaskExt,
        TickPhase, WhenAll, WhenAny, async_task,
    };
}
