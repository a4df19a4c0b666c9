//! Outcome taxonomy: `Canceled` and `Faulted` are values carried by
//! [`TaskError`]; [`ProtocolViolation`]s are programmer errors and panic.

use std::{
    any::Any, borrow::Cow, error::Error, fmt, sync::Arc, time::Duration,
};

/// A captured error, cheap to clone so a single fault can be replayed to
/// several observers.
#[derive(Clone)]
pub struct Fault(Arc<dyn Error + Send + Sync + 'static>);

impl Fault {
    pub fn new<E: Error + Send + Sync + 'static>(error: E) -> Self {
        Self(Arc::new(error))
    }

    /// Builds a fault from a bare message.
    pub fn msg(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(FaultMessage(message.into()))
    }

    /// Converts the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(payload) => match payload.downcast::<String>() {
                Ok(message) => *message,
                Err(_) => "Box<dyn Any>".to_owned(),
            },
        };
        Self::new(PanicError { message })
    }

    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn is<E: Error + 'static>(&self) -> bool {
        self.0.is::<E>()
    }

    /// Returns `true` when both faults are clones of the same capture.
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl Error for Fault {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct FaultMessage(Cow<'static, str>);

/// A panic caught while advancing a poll item, running a continuation or
/// polling a spawned future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("panicked: {message}")]
pub struct PanicError {
    pub message: String,
}

/// Raised by timeouts when the deadline wins the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {after:?}")]
pub struct TimeoutError {
    pub after: Duration,
}

/// Why an operation ended up canceled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A [`CancelSource`](crate::CancelSource) was tripped.
    Requested,
    /// The runtime's cancel generation moved past the one captured when the
    /// operation was created.
    CancelAll,
    Message(Cow<'static, str>),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("cancellation requested"),
            Self::CancelAll => f.write_str("all in-flight operations canceled"),
            Self::Message(message) => f.write_str(message),
        }
    }
}

/// The error side of every [`Task`](crate::Task) result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("operation canceled: {0}")]
    Canceled(CancelReason),
    #[error(transparent)]
    Faulted(Fault),
}

impl TaskError {
    pub fn canceled() -> Self {
        Self::Canceled(CancelReason::Requested)
    }

    pub fn msg(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Faulted(Fault::msg(message))
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    #[inline]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    /// Returns `true` when this is the fault raised by an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        self.fault().is_some_and(Fault::is::<TimeoutError>)
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Canceled(_) => None,
        }
    }

    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            Self::Canceled(reason) => Some(reason),
            Self::Faulted(_) => None,
        }
    }
}

impl From<Fault> for TaskError {
    fn from(fault: Fault) -> Self {
        Self::Faulted(fault)
    }
}

impl From<CancelReason> for TaskError {
    fn from(reason: CancelReason) -> Self {
        Self::Canceled(reason)
    }
}

impl From<TimeoutError> for TaskError {
    fn from(error: TimeoutError) -> Self {
        Self::Faulted(Fault::new(error))
    }
}

/// Misuse of a task or of the runtime.
///
/// These are never recovered: [`protocol_violation`] panics with the
/// violation so tests fail at the offending call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error(
        "token mismatch (current version {current}, handle version {token}): \
         the task was already awaited or its status was read after completion"
    )]
    TokenMismatch { current: u16, token: u16 },
    #[error("a continuation is already registered for this task")]
    AlreadyAwaiting,
    #[error("result requested before the task completed")]
    NotCompleted,
    #[error("result already taken from this task")]
    AlreadyConsumed,
    #[error("no tick runtime is initialized for this thread")]
    RuntimeNotInitialized,
    #[error("tick phase {0} driven off the runtime's main thread")]
    OffMainThread(&'static str),
    #[error("tick phase {0} driven from inside its own pass")]
    ReentrantDrive(&'static str),
    #[error("when_each sequence enumerated more than once")]
    AlreadyEnumerated,
}

/// Raises `violation` at the caller's location.
#[cold]
#[track_caller]
pub fn protocol_violation(violation: ProtocolViolation) -> ! {
    panic!("protocol violation: {violation}")
}
