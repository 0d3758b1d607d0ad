//! Producer side of foreground futures
//!
//! A CompletionSource owns a future, and is the only thing which is allowed
//! to move it to a terminal state. Only the first completion attempt succeeds.
//! The try_* methods report whether they won, while the set_* methods treat
//! a lost race as a usage error.

use crate::cancel::CancellationToken;
use crate::coroutine::{CatchUnwind, Coroutine};
use crate::error::{AggregateError, Cause, PanicError, UsageError};
use crate::future::{Future, FutureValue};
use crate::scheduler::SchedulerHandle;
use crate::status::FutureStatus;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};


/// Handle used to complete a Future
pub struct CompletionSource<T> {
    future: Future<T>,
}
//
impl<T: FutureValue> CompletionSource<T> {
    /// Create a source and its pending future, whose continuations will be
    /// delivered by a given scheduler
    pub fn new(scheduler: &SchedulerHandle) -> Self {
        Self {
            future: Future::with_status(scheduler, FutureStatus::Pending),
        }
    }

    /// Future controlled by this source
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    /// Attempt to complete the future with a value
    pub fn try_set_result(&self, value: T) -> bool {
        self.try_set_status(FutureStatus::Completed(value))
    }

    /// Complete the future with a value
    pub fn set_result(&self, value: T) -> Result<(), UsageError> {
        check_transition(self.try_set_result(value))
    }

    /// Attempt to fault the future with an error
    ///
    /// Passing an AggregateError faults the future with each of its causes.
    ///
    pub fn try_set_exception<E>(&self, error: E) -> bool
        where E: Error + Send + Sync + 'static
    {
        self.try_set_aggregate(AggregateError::new(error))
    }

    /// Fault the future with an error
    pub fn set_exception<E>(&self, error: E) -> Result<(), UsageError>
        where E: Error + Send + Sync + 'static
    {
        check_transition(self.try_set_exception(error))
    }

    /// Attempt to fault the future with a set of errors
    pub fn try_set_aggregate(&self, error: AggregateError) -> bool {
        self.try_set_status(FutureStatus::Faulted(error))
    }

    /// Attempt to fault the future with several errors at once
    ///
    /// Faulting a future requires at least one error.
    ///
    pub fn try_set_exceptions<I>(&self, causes: I) -> Result<bool, UsageError>
        where I: IntoIterator<Item = Cause>
    {
        let error = AggregateError::from_causes(causes).ok_or(UsageError::EmptyInput)?;
        Ok(self.try_set_aggregate(error))
    }

    /// Attempt to cancel the future
    pub fn try_set_canceled(&self) -> bool {
        self.try_set_status(FutureStatus::Canceled)
    }

    /// Cancel the future
    pub fn set_canceled(&self) -> Result<(), UsageError> {
        check_transition(self.try_set_canceled())
    }

    /// Attempt to move the future to some terminal status
    pub(crate) fn try_set_status(&self, status: FutureStatus<T>) -> bool {
        self.future.try_complete(status)
    }

    /// Attempt to complete the future with the outcome of some computation
    pub(crate) fn try_set_outcome(&self, outcome: Result<T, AggregateError>) -> bool {
        self.try_set_status(outcome.into())
    }

    /// Cancel the future when a token is canceled
    ///
    /// The token registration is disposed of once the future is terminal.
    ///
    pub(crate) fn cancel_on(&self, token: &CancellationToken) {
        if !token.can_be_canceled() {
            return;
        }
        let source = self.clone();
        let mut registration = token.register(move || {
            source.try_set_canceled();
        });
        self.future.add_continuation(move |_| {
            registration.dispose();
        });
    }
}
//
impl<T> Clone for CompletionSource<T> {
    fn clone(&self) -> Self {
        Self { future: self.future.clone() }
    }
}
//
impl<T: FutureValue> fmt::Debug for CompletionSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CompletionSource").field("future", &self.future).finish()
    }
}


fn check_transition(succeeded: bool) -> Result<(), UsageError> {
    if succeeded { Ok(()) } else { Err(UsageError::AlreadyCompleted) }
}


/// Run user code, turning panics into a fault
pub(crate) fn capture<U>(f: impl FnOnce() -> U) -> Result<U, AggregateError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        AggregateError::new(PanicError::from_payload(&*payload))
    })
}


/// Drive a coroutine on the scheduler, completing a source with its outcome
///
/// Canceling the source's future evicts the coroutine's work item.
///
pub(crate) fn run_coroutine<C>(scheduler: &SchedulerHandle,
                               coroutine: C,
                               source: CompletionSource<C::Output>)
    where C: Coroutine,
          C::Output: FutureValue
{
    let c_source = source.clone();
    let work = scheduler.post_coroutine(CatchUnwind::new(coroutine), move |outcome| {
        c_source.try_set_outcome(outcome);
    });
    source.future.attach_work(work.id());
}
