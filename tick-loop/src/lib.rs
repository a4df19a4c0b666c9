//! The tick scheduler and the operations it drives.
//!
//! A host calls [`Runtime::drive_tick`] once per occurrence of each
//! [`TickPhase`]. Each tick first runs the continuations queued during the
//! previous one, then advances every item in the phase's poll list once.

mod continuation;
mod delay;
mod phase;
mod poll_list;
mod promise;
mod runtime;
mod wait;
mod yield_now;

pub use delay::{
    DelayType, delay, delay_frame, delay_frame_with, delay_with, next_frame,
    next_frame_with, yield_task, yield_task_with,
};
pub use phase::{TickContext, TickOptions, TickPhase};
pub use poll_list::{PollItem, PollItemRef};
pub use runtime::{EnterGuard, InitError, Runtime, RuntimeBuilder};
pub use wait::{
    wait_until, wait_until_value_changed, wait_until_value_changed_with,
    wait_until_with, wait_while, wait_while_with,
};
pub use yield_now::{YieldNow, yield_now, yield_now_in};
