//! Joining several futures
//!
//! These combinators never cancel their inputs. Whatever happens to the joined
//! future, each input keeps going and can still be observed through its own
//! handles.

use crate::completion::{capture, run_coroutine, CompletionSource};
use crate::coroutine::Coroutine;
use crate::error::{AggregateError, UsageError};
use crate::factory::TaskFactory;
use crate::future::{Future, FutureValue};
use crate::status::FutureStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;


impl TaskFactory {
    /// Future which completes with the inputs, once all of them are terminal
    ///
    /// Unlike when_all(), this never fails: inspecting the inputs is left to
    /// the caller.
    ///
    pub fn when_all_settled<T: FutureValue>(&self, futures: Vec<Future<T>>)
                                            -> Future<Vec<Future<T>>> {
        let source = CompletionSource::new(self.scheduler());
        let settled = source.future();
        if futures.is_empty() {
            source.try_set_result(futures);
            return settled;
        }

        let inputs = Arc::new(futures);
        let remaining = Arc::new(AtomicUsize::new(inputs.len()));
        for input in inputs.iter() {
            let source = source.clone();
            let inputs = inputs.clone();
            let remaining = remaining.clone();
            input.add_continuation(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    trace!(inputs = inputs.len(), "all inputs settled");
                    source.try_set_result(inputs.as_ref().clone());
                }
            });
        }
        settled
    }

    /// Future which completes with every input's value, in input order
    ///
    /// If any input failed, the joined future fails with the errors of all
    /// failed inputs. Otherwise, if any input was canceled, it is canceled.
    ///
    pub fn when_all<T: FutureValue>(&self, futures: Vec<Future<T>>) -> Future<Vec<T>> {
        let source = CompletionSource::new(self.scheduler());
        let joined = source.future();
        self.when_all_settled(futures).add_continuation(move |settled| {
            if let Ok(inputs) = settled.result() {
                source.try_set_status(join_statuses(&inputs));
            }
        });
        joined
    }

    /// Future which completes with whichever input reaches a terminal state
    /// first
    ///
    /// There must be at least one input.
    ///
    pub fn when_any<T: FutureValue>(&self, futures: Vec<Future<T>>)
                                    -> Result<Future<Future<T>>, UsageError> {
        if futures.is_empty() {
            return Err(UsageError::EmptyInput);
        }
        let source = CompletionSource::new(self.scheduler());
        let winner = source.future();
        for input in &futures {
            let source = source.clone();
            input.add_continuation(move |input| {
                source.try_set_result(input.clone());
            });
        }
        Ok(winner)
    }

    /// Run a continuation on the inputs, once all of them are terminal
    pub fn continue_when_all<T, U, F>(&self, futures: Vec<Future<T>>, continuation: F)
                                      -> Future<U>
        where T: FutureValue,
              U: FutureValue,
              F: FnOnce(&[Future<T>]) -> U + Send + 'static
    {
        self.when_all_settled(futures).continue_with(move |settled| {
            let inputs = settled.result().unwrap_or_default();
            continuation(&inputs)
        })
    }

    /// Drive a coroutine built out of the inputs, once all of them are
    /// terminal
    pub fn continue_when_all_coroutine<T, C, F>(&self,
                                                futures: Vec<Future<T>>,
                                                continuation: F)
                                                -> Future<C::Output>
        where T: FutureValue,
              C: Coroutine,
              C::Output: FutureValue,
              F: FnOnce(&[Future<T>]) -> C + Send + 'static
    {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        self.when_all_settled(futures).add_continuation(move |settled| {
            let inputs = settled.result().unwrap_or_default();
            match capture(|| continuation(&inputs)) {
                Ok(coroutine) => run_coroutine(settled.scheduler(), coroutine, source),
                Err(error) => {
                    source.try_set_aggregate(error);
                }
            }
        });
        future
    }
}


/// Join the statuses of terminal futures
fn join_statuses<T: FutureValue>(inputs: &[Future<T>]) -> FutureStatus<Vec<T>> {
    let mut faults = Vec::new();
    let mut canceled = false;
    let mut values = Vec::with_capacity(inputs.len());
    for input in inputs {
        match input.status() {
            FutureStatus::Completed(value) => values.push(value),
            FutureStatus::Faulted(error) => faults.push(error),
            FutureStatus::Canceled => canceled = true,
            FutureStatus::Pending => {}
        }
    }
    if let Some(error) = AggregateError::join(faults) {
        FutureStatus::Faulted(error)
    } else if canceled {
        FutureStatus::Canceled
    } else {
        FutureStatus::Completed(values)
    }
}
