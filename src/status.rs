//! Facilities to represent the status of foreground futures
//!
//! The model is the following: any future starts in a pending state, and
//! eventually ends up in one of three terminal states. Either the work
//! produced a value, or it failed with one or more errors, or it was canceled
//! before it could produce anything.
//!
//! Once a future has reached a terminal state, its status won't change anymore.

use crate::error::AggregateError;


/// Representation of a future's status
///
/// Here are the possible state transitions:
///
/// - Pending -> Completed / Faulted / Canceled
///
/// Terminal statuses are never left.
///
#[derive(Clone, Debug)]
pub enum FutureStatus<T> {
    /// The work has not finished yet
    Pending,

    /// The work has produced a value
    Completed(T),

    /// The work has failed, possibly for several reasons at once
    Faulted(AggregateError),

    /// The work was canceled before it produced a value
    Canceled,
}
//
impl<T> FutureStatus<T> {
    /// Check if the status is final (i.e. won't change anymore)
    pub fn is_final(&self) -> bool {
        !matches!(self, FutureStatus::Pending)
    }

    /// Payload-free summary of this status
    pub fn kind(&self) -> StatusKind {
        match self {
            FutureStatus::Pending => StatusKind::Pending,
            FutureStatus::Completed(_) => StatusKind::Completed,
            FutureStatus::Faulted(_) => StatusKind::Faulted,
            FutureStatus::Canceled => StatusKind::Canceled,
        }
    }
}
//
impl<T> From<Result<T, AggregateError>> for FutureStatus<T> {
    fn from(outcome: Result<T, AggregateError>) -> Self {
        match outcome {
            Ok(value) => FutureStatus::Completed(value),
            Err(error) => FutureStatus::Faulted(error),
        }
    }
}


/// Payload-free version of FutureStatus, cheap to copy around and compare
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// See FutureStatus::Pending
    Pending,

    /// See FutureStatus::Completed
    Completed,

    /// See FutureStatus::Faulted
    Faulted,

    /// See FutureStatus::Canceled
    Canceled,
}
//
impl StatusKind {
    /// Check if the status is final (i.e. won't change anymore)
    pub fn is_final(self) -> bool {
        self != StatusKind::Pending
    }
}
