//! Error types
//!
//! Two very different kinds of errors flow through this crate:
//!
//! - Faults are errors produced by the asynchronous work itself. They are
//!   captured where they happen and stored inside of the future, where they
//!   can be observed by whoever holds it. A fault that nobody inspects is lost.
//! - Usage errors are caused by the caller doing something which the API
//!   contract forbids, such as reading the result of a pending future. They
//!   are reported synchronously to the offending caller.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;


/// One captured fault
pub type Cause = Arc<dyn Error + Send + Sync + 'static>;


/// Wrap an error into a fault cause
pub fn cause<E>(error: E) -> Cause
    where E: Error + Send + Sync + 'static
{
    Arc::new(error)
}


/// Ordered, non-empty list of faults
///
/// Aggregates never nest: building an aggregate out of causes which are
/// themselves aggregates splices their causes in place.
///
#[derive(Clone, Debug, Error)]
#[error("{} error(s) occurred: {}", .causes.len(), CauseList(.causes))]
pub struct AggregateError {
    causes: Vec<Cause>,
}
//
impl AggregateError {
    /// Aggregate a single error
    pub fn new<E>(error: E) -> Self
        where E: Error + Send + Sync + 'static
    {
        Self::from_cause(cause(error))
    }

    /// Aggregate a single, already wrapped, cause
    pub fn from_cause(cause: Cause) -> Self {
        let mut causes = Vec::with_capacity(1);
        push_flattened(&mut causes, cause);
        Self { causes }
    }

    /// Aggregate several causes, fails if there are none
    pub fn from_causes<I>(causes: I) -> Option<Self>
        where I: IntoIterator<Item = Cause>
    {
        let mut flattened = Vec::new();
        for cause in causes {
            push_flattened(&mut flattened, cause);
        }
        (!flattened.is_empty()).then_some(Self { causes: flattened })
    }

    /// Concatenate the causes of several aggregates, in order
    pub fn join<I>(aggregates: I) -> Option<Self>
        where I: IntoIterator<Item = AggregateError>
    {
        Self::from_causes(aggregates.into_iter().flat_map(|a| a.causes))
    }

    /// Individual causes, in capture order
    pub fn causes(&self) -> &[Cause] {
        &self.causes
    }

    /// First captured cause
    pub fn first(&self) -> &Cause {
        &self.causes[0]
    }

    /// Number of causes (always at least one)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.causes.len()
    }

    /// Check if any cause is of a given concrete error type
    pub fn contains<E: Error + 'static>(&self) -> bool {
        self.causes.iter().any(|c| c.downcast_ref::<E>().is_some())
    }

    /// Turn a caught unwinding payload into a fault
    ///
    /// Aggregates which were rethrown as payloads come back unchanged, any
    /// other payload becomes a PanicError.
    ///
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<AggregateError>() {
            Ok(error) => *error,
            Err(payload) => Self::new(PanicError::from_payload(&*payload)),
        }
    }
}


fn push_flattened(causes: &mut Vec<Cause>, cause: Cause) {
    match cause.downcast_ref::<AggregateError>() {
        Some(nested) => causes.extend(nested.causes.iter().cloned()),
        None => causes.push(cause),
    }
}


struct CauseList<'a>(&'a [Cause]);
//
impl fmt::Display for CauseList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (index, cause) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{cause}")?;
        }
        write!(f, "]")
    }
}


/// Misuse of the API, reported synchronously to the caller
#[derive(Clone, Debug, Error)]
pub enum UsageError {
    /// The result of a future was read before it reached a terminal state
    #[error("the future has not reached a terminal state yet")]
    NotCompleted,

    /// The result of a faulted future was read
    #[error("the future is faulted")]
    Faulted(#[source] AggregateError),

    /// The result of a canceled future was read
    #[error("the future was canceled")]
    Canceled,

    /// A future which already reached a terminal state was completed again
    #[error("the future has already reached a terminal state")]
    AlreadyCompleted,

    /// A blocking send was issued from the foreground thread, which would
    /// wait forever for itself
    #[error("send() called from the foreground thread would deadlock")]
    SendFromForeground,

    /// A foreground-only operation was called from another thread
    #[error("this operation must be called from the foreground thread")]
    NotForeground,

    /// The scheduler was shut down
    #[error("the scheduler has been shut down")]
    SchedulerClosed,

    /// An operation which needs at least one input received none
    #[error("at least one input is required")]
    EmptyInput,
}


/// Failure of a blocking send
#[derive(Clone, Debug, Error)]
pub enum SendError {
    /// The send itself was invalid
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The action was delivered, but panicked on the foreground thread
    #[error("the sent action panicked")]
    Panicked(#[source] PanicError),
}


/// A panic which was caught in user code and turned into a fault
#[derive(Clone, Debug, Error)]
#[error("panicked: {message}")]
pub struct PanicError {
    message: String,
}
//
impl PanicError {
    /// Build a panic error with a given message
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Extract the message of a caught panic payload
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self { message }
    }

    /// Message carried by the panic
    pub fn message(&self) -> &str {
        &self.message
    }
}
