//! Bridges between foreground futures and background tasks
//!
//! Foreground futures can be handed to thread pool code as BackgroundTasks,
//! and background tasks can be brought back to the foreground thread as
//! Futures. Faults and cancellation cross the bridge unchanged. A background
//! task which ended without a value nor an error faults the foreground side
//! with its TaskDiagnostic.

use crate::background::{BackgroundError, BackgroundOp, BackgroundOutcome, BackgroundStatus,
                        BackgroundTask, PoolHandle, TaskDiagnostic};
use crate::cancel::CancellationToken;
use crate::completion::CompletionSource;
use crate::error::AggregateError;
use crate::future::{Future, FutureValue};
use crate::scheduler::SchedulerHandle;
use crate::status::FutureStatus;
use tracing::trace;


impl<T: FutureValue> Future<T> {
    /// Background task which ends like this future
    ///
    /// If this future is dropped by all of its owners before reaching a
    /// terminal state, the task ends with a diagnostic.
    ///
    pub fn to_background(&self) -> BackgroundTask<T> {
        let (mut completer, task) = BackgroundOp::new().split();
        self.add_continuation(move |future| {
            completer.complete(background_outcome(future));
        });
        task
    }

    /// Once this future has a value, process it on a thread pool
    ///
    /// Faults and cancellation of this future propagate to the returned task.
    /// If the token is canceled before the pool got to run the processing,
    /// the task ends with a diagnostic of the canceled pool job.
    ///
    pub fn continue_to_background<U, F>(&self,
                                        pool: &PoolHandle,
                                        f: F,
                                        token: &CancellationToken)
                                        -> BackgroundTask<U>
        where U: FutureValue,
              F: FnOnce(T) -> U + Send + 'static
    {
        let (mut completer, task) = BackgroundOp::new().split();
        let pool = pool.clone();
        let token = token.clone();
        self.add_continuation(move |antecedent| {
            let value = match background_outcome(antecedent) {
                Ok(value) => value,
                Err(error) => {
                    completer.complete(Err(error));
                    return;
                }
            };
            let job = pool.spawn_with_cancellation(move || f(value), &token);
            let job_id = job.id();
            job.on_complete(move |outcome| {
                let outcome = match outcome {
                    Err(BackgroundError::Canceled) => {
                        Err(BackgroundError::NoValue(TaskDiagnostic {
                            id: job_id,
                            faulted: false,
                            canceled: true,
                            status: BackgroundStatus::Canceled,
                        }))
                    }
                    other => other.clone(),
                };
                completer.complete(outcome);
            });
        });
        task
    }
}


impl<T: FutureValue> BackgroundTask<T> {
    /// Foreground future which ends like this task
    ///
    /// The outcome is delivered through the scheduler, on the foreground
    /// thread. If the token is already canceled, the future is canceled right
    /// away without even looking at the task. If it is canceled later on, the
    /// future is canceled unless the task ended first.
    ///
    pub fn to_foreground(&self,
                         scheduler: &SchedulerHandle,
                         token: &CancellationToken) -> Future<T> {
        if token.is_canceled() {
            return Future::from_canceled(scheduler);
        }
        let source = CompletionSource::new(scheduler);
        let future = source.future();
        source.cancel_on(token);

        let scheduler = scheduler.clone();
        let task_id = self.id();
        self.on_complete(move |outcome| {
            let status = foreground_status(outcome);
            trace!(task_id, kind = ?status.kind(), "background task ended");
            scheduler.delivery_executor().execute(Box::new(move || {
                source.try_set_status(status);
            }));
        });
        future
    }

    /// Run a continuation on the foreground thread once this task has ended
    ///
    /// The continuation does not run if the token is canceled first.
    ///
    pub fn continue_to_foreground<U, F>(&self,
                                        scheduler: &SchedulerHandle,
                                        continuation: F,
                                        token: &CancellationToken)
                                        -> Future<U>
        where U: FutureValue,
              F: FnOnce(&Future<T>) -> U + Send + 'static
    {
        self.to_foreground(scheduler, &CancellationToken::none())
            .continue_with_cancellation(token, continuation)
    }
}


/// Translate the terminal status of a future into a background outcome
fn background_outcome<T: FutureValue>(future: &Future<T>) -> BackgroundOutcome<T> {
    match future.status() {
        FutureStatus::Completed(value) => Ok(value),
        FutureStatus::Faulted(error) => Err(BackgroundError::Faulted(error)),
        FutureStatus::Canceled => Err(BackgroundError::Canceled),
        FutureStatus::Pending => Err(BackgroundError::NoValue(TaskDiagnostic {
            id: future.id(),
            faulted: false,
            canceled: false,
            status: BackgroundStatus::Running,
        })),
    }
}


/// Translate a background outcome into a foreground status
fn foreground_status<T: Clone>(outcome: &BackgroundOutcome<T>) -> FutureStatus<T> {
    match outcome {
        Ok(value) => FutureStatus::Completed(value.clone()),
        Err(BackgroundError::Faulted(error)) => FutureStatus::Faulted(error.clone()),
        Err(BackgroundError::Canceled) => FutureStatus::Canceled,
        Err(BackgroundError::NoValue(diagnostic)) => {
            FutureStatus::Faulted(AggregateError::new(diagnostic.clone()))
        }
    }
}
