use std::{sync::Arc, task::Waker};

use crate::error::TaskError;

/// Lifecycle of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Pending = 0,
    Succeeded = 1,
    Faulted = 2,
    Canceled = 3,
}

impl Status {
    #[inline]
    pub fn is_completed(self) -> bool {
        self != Self::Pending
    }

    #[inline]
    pub fn is_succeeded(self) -> bool {
        self == Self::Succeeded
    }

    #[inline]
    pub fn is_faulted(self) -> bool {
        self == Self::Faulted
    }

    #[inline]
    pub fn is_canceled(self) -> bool {
        self == Self::Canceled
    }

    #[inline]
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Succeeded,
            2 => Self::Faulted,
            3 => Self::Canceled,
            _ => Self::Pending,
        }
    }
}

/// The polling contract behind a [`Task`](crate::Task).
///
/// Every call carries the version `token` the handle was created with. A
/// source that has been consumed and recycled has moved on to a newer
/// version and must reject the stale token with
/// [`ProtocolViolation::TokenMismatch`](crate::ProtocolViolation).
///
/// `get_result` is called at most once per token and is where pooled sources
/// reset themselves and return to their pool.
pub trait TaskSource<T> {
    fn status(&self, token: u16) -> Status;

    /// Registers `waker` as the single continuation for `token`.
    ///
    /// If the source already completed the waker is woken synchronously.
    fn on_completed(&self, waker: &Waker, token: u16);

    fn get_result(&self, token: u16) -> Result<T, TaskError>;

    /// Status without token validation, for diagnostics only.
    fn unsafe_status(&self) -> Status;
}

/// Shared reference to a type-erased source.
pub type SourceRef<T> = Arc<dyn TaskSource<T> + Send + Sync>;
