//! Foreground futures
//!
//! A Future represents the eventual outcome of one unit of work. It starts out
//! pending, and is moved to a terminal state exactly once by its
//! CompletionSource. Consumers may inspect it at any time, and register
//! continuations which run once it is terminal.
//!
//! Continuations are delivered according to the following rule: if the future
//! reaches its terminal state (or the continuation is registered on an already
//! terminal future) on the foreground thread, they run inline. Otherwise, they
//! are queued as one batch on the scheduler and run on its next tick. While a
//! batch is queued or running, continuations registered in the meantime join
//! it instead of running ahead of it. Either way, continuations of one future
//! run in registration order, exactly once, and never while the future's
//! internal lock is held.

use crate::completion::{capture, run_coroutine, CompletionSource};
use crate::cancel::CancellationToken;
use crate::coroutine::Coroutine;
use crate::error::{AggregateError, PanicError, UsageError};
use crate::scheduler::{SchedulerHandle, WorkId};
use crate::status::{FutureStatus, StatusKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, trace};


/// Values which futures can carry
///
/// Results are handed out by copy, to every reader of a future, hence the
/// Clone requirement.
///
pub trait FutureValue: Clone + Send + 'static {}
//
impl<T: Clone + Send + 'static> FutureValue for T {}


/// Source of process-unique future identifiers
static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);


/// Callback registered on a future
type Continuation<T> = Box<dyn FnOnce(&Future<T>) + Send + 'static>;


/// Mutable state of a future
struct State<T> {
    /// Current status
    status: FutureStatus<T>,

    /// Continuations not run yet, in registration order
    continuations: VecDeque<Continuation<T>>,

    /// A batch of continuations is queued or running
    delivering: bool,

    /// Work item producing this future, evicted if it gets canceled
    work: Option<WorkId>,
}


/// State shared by all clones of a future
struct Inner<T> {
    /// Process-unique identifier, used in diagnostics
    id: u64,

    /// Scheduler in charge of continuation delivery
    scheduler: SchedulerHandle,

    /// Status and continuations
    state: Mutex<State<T>>,
}


/// Eventual outcome of a unit of work
///
/// Clones refer to the same underlying future.
///
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}
//
impl<T: FutureValue> Future<T> {
    /// Build a future with some initial status
    pub(crate) fn with_status(scheduler: &SchedulerHandle,
                              status: FutureStatus<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
                scheduler: scheduler.clone(),
                state: Mutex::new(State {
                    status,
                    continuations: VecDeque::new(),
                    delivering: false,
                    work: None,
                }),
            }),
        }
    }

    /// Future which is already completed with some value
    pub fn from_result(scheduler: &SchedulerHandle, value: T) -> Self {
        Self::with_status(scheduler, FutureStatus::Completed(value))
    }

    /// Future which already failed with some error
    pub fn from_exception<E>(scheduler: &SchedulerHandle, error: E) -> Self
        where E: Error + Send + Sync + 'static
    {
        Self::from_aggregate(scheduler, AggregateError::new(error))
    }

    /// Future which already failed with a set of errors
    pub fn from_aggregate(scheduler: &SchedulerHandle, error: AggregateError) -> Self {
        Self::with_status(scheduler, FutureStatus::Faulted(error))
    }

    /// Future which is already canceled
    pub fn from_canceled(scheduler: &SchedulerHandle) -> Self {
        Self::with_status(scheduler, FutureStatus::Canceled)
    }

    /// Process-unique identifier of this future
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Scheduler which delivers this future's continuations
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    /// Check if the future reached any terminal state
    pub fn is_completed(&self) -> bool {
        self.kind().is_final()
    }

    /// Check if the future completed with a value
    pub fn is_completed_successfully(&self) -> bool {
        self.kind() == StatusKind::Completed
    }

    /// Check if the future failed
    pub fn is_faulted(&self) -> bool {
        self.kind() == StatusKind::Faulted
    }

    /// Check if the future was canceled
    pub fn is_canceled(&self) -> bool {
        self.kind() == StatusKind::Canceled
    }

    /// Payload-free status of the future
    pub fn kind(&self) -> StatusKind {
        self.inner.state.lock().status.kind()
    }

    /// Snapshot of the future's status
    pub fn status(&self) -> FutureStatus<T> {
        self.inner.state.lock().status.clone()
    }

    /// Value of a successfully completed future
    ///
    /// Reading the result of a future which is still pending, or which failed
    /// or was canceled, is a usage error.
    ///
    pub fn result(&self) -> Result<T, UsageError> {
        match self.status() {
            FutureStatus::Pending => Err(UsageError::NotCompleted),
            FutureStatus::Completed(value) => Ok(value),
            FutureStatus::Faulted(error) => Err(UsageError::Faulted(error)),
            FutureStatus::Canceled => Err(UsageError::Canceled),
        }
    }

    /// Errors of a faulted future
    pub fn exception(&self) -> Option<AggregateError> {
        match &self.inner.state.lock().status {
            FutureStatus::Faulted(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Register a callback to be run once the future is terminal
    ///
    /// If the future is already terminal, the callback is delivered right
    /// away, according to the delivery rule of the calling thread.
    ///
    pub fn add_continuation<F>(&self, continuation: F)
        where F: FnOnce(&Future<T>) + Send + 'static
    {
        let start_delivery = {
            let mut state = self.inner.state.lock();
            state.continuations.push_back(Box::new(continuation));
            state.status.is_final() && !std::mem::replace(&mut state.delivering, true)
        };
        if start_delivery {
            self.deliver();
        }
    }

    /// Attempt the transition from pending to a terminal status
    ///
    /// Only the first attempt succeeds, returning true. It then hands out
    /// pending continuations for delivery and, if the future was canceled,
    /// evicts the work item which was producing it.
    ///
    pub(crate) fn try_complete(&self, status: FutureStatus<T>) -> bool {
        if !status.is_final() {
            return false;
        }
        let kind = status.kind();
        let (continuations, work) = {
            let mut state = self.inner.state.lock();
            if state.status.is_final() {
                return false;
            }
            state.status = status;
            let continuations = state.continuations.len();
            state.delivering = continuations > 0;
            (continuations, state.work.take())
        };
        trace!(id = self.inner.id, ?kind, continuations,
               "future reached a terminal state");

        if let (StatusKind::Canceled, Some(work)) = (kind, work) {
            self.inner.scheduler.cancel(work);
        }
        if continuations > 0 {
            self.deliver();
        }
        true
    }

    /// Record the work item producing this future
    ///
    /// If the future was canceled before the work item was attached, the work
    /// item is evicted right away.
    ///
    pub(crate) fn attach_work(&self, work: WorkId) {
        let canceled = {
            let mut state = self.inner.state.lock();
            match state.status {
                FutureStatus::Pending => {
                    state.work = Some(work);
                    false
                }
                FutureStatus::Canceled => true,
                _ => false,
            }
        };
        if canceled {
            self.inner.scheduler.cancel(work);
        }
    }

    /// Hand out a batch delivery to the calling thread's executor
    ///
    /// The batch runs continuations until none is left, including those
    /// registered while it was queued or running. Must only be called by
    /// whoever switched the delivering flag on.
    ///
    fn deliver(&self) {
        let future = self.clone();
        self.inner.scheduler.delivery_executor().execute(Box::new(move || {
            loop {
                let continuation = {
                    let mut state = future.inner.state.lock();
                    match state.continuations.pop_front() {
                        Some(continuation) => continuation,
                        None => {
                            state.delivering = false;
                            return;
                        }
                    }
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    continuation(&future)
                }));
                if let Err(payload) = result {
                    let error = PanicError::from_payload(&*payload);
                    error!(id = future.id(), %error, "continuation panicked");
                }
            }
        }));
    }

    /// Chain a continuation, whose return value completes the new future
    ///
    /// A panic in the continuation faults the new future.
    ///
    pub fn continue_with<U, F>(&self, continuation: F) -> Future<U>
        where U: FutureValue,
              F: FnOnce(&Future<T>) -> U + Send + 'static
    {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        self.add_continuation(move |antecedent| {
            source.try_set_outcome(capture(|| continuation(antecedent)));
        });
        future
    }

    /// Chain a fallible continuation, whose errors fault the new future
    pub fn try_continue_with<U, E, F>(&self, continuation: F) -> Future<U>
        where U: FutureValue,
              E: Error + Send + Sync + 'static,
              F: FnOnce(&Future<T>) -> Result<U, E> + Send + 'static
    {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        self.add_continuation(move |antecedent| {
            let outcome = capture(|| continuation(antecedent))
                .and_then(|result| result.map_err(AggregateError::new));
            source.try_set_outcome(outcome);
        });
        future
    }

    /// Chain a continuation which can be canceled
    ///
    /// If the token is canceled before the continuation got to run, the new
    /// future is canceled and the continuation never runs. The token
    /// registration is disposed as soon as the new future is terminal.
    ///
    pub fn continue_with_cancellation<U, F>(&self,
                                            token: &CancellationToken,
                                            continuation: F) -> Future<U>
        where U: FutureValue,
              F: FnOnce(&Future<T>) -> U + Send + 'static
    {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        source.cancel_on(token);
        let token = token.clone();
        self.add_continuation(move |antecedent| {
            if token.is_canceled() {
                source.try_set_canceled();
            } else {
                source.try_set_outcome(capture(|| continuation(antecedent)));
            }
        });
        future
    }

    /// Chain a continuation which starts another asynchronous operation
    ///
    /// The new future reflects the outcome of that operation.
    ///
    pub fn continue_with_future<U, F>(&self, continuation: F) -> Future<U>
        where U: FutureValue,
              F: FnOnce(&Future<T>) -> Future<U> + Send + 'static
    {
        self.continue_with(continuation).flatten()
    }

    /// Chain a continuation which returns a coroutine, which is then driven
    /// by the scheduler until it produces the value of the new future
    pub fn continue_with_coroutine<C, F>(&self, continuation: F) -> Future<C::Output>
        where C: Coroutine,
              C::Output: FutureValue,
              F: FnOnce(&Future<T>) -> C + Send + 'static
    {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        self.add_continuation(move |antecedent| {
            match capture(|| continuation(antecedent)) {
                Ok(coroutine) => run_coroutine(antecedent.scheduler(), coroutine, source),
                Err(error) => {
                    source.try_set_aggregate(error);
                }
            }
        });
        future
    }

    /// Chain a continuation which only runs if this future has a value
    ///
    /// Faults and cancellation propagate to the new future untouched.
    ///
    pub fn on_success<U, F>(&self, continuation: F) -> Future<U>
        where U: FutureValue,
              F: FnOnce(T) -> U + Send + 'static
    {
        self.try_on_success(move |value| {
            Ok::<U, std::convert::Infallible>(continuation(value))
        })
    }

    /// Fallible version of on_success()
    pub fn try_on_success<U, E, F>(&self, continuation: F) -> Future<U>
        where U: FutureValue,
              E: Error + Send + Sync + 'static,
              F: FnOnce(T) -> Result<U, E> + Send + 'static
    {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        self.add_continuation(move |antecedent| {
            match antecedent.status() {
                FutureStatus::Completed(value) => {
                    let outcome = capture(move || continuation(value))
                        .and_then(|result| result.map_err(AggregateError::new));
                    source.try_set_outcome(outcome);
                }
                FutureStatus::Faulted(error) => {
                    source.try_set_aggregate(error);
                }
                FutureStatus::Canceled => {
                    source.try_set_canceled();
                }
                FutureStatus::Pending => {}
            }
        });
        future
    }
}
//
impl<T: FutureValue> Future<Future<T>> {
    /// Turn a future of a future into a future of the inner value
    ///
    /// The first fault or cancellation encountered, at either level, is
    /// propagated.
    ///
    pub fn flatten(&self) -> Future<T> {
        let source = CompletionSource::new(self.scheduler());
        let future = source.future();
        self.add_continuation(move |outer| {
            match outer.status() {
                FutureStatus::Completed(inner) => {
                    inner.add_continuation(move |inner| {
                        source.try_set_status(inner.status());
                    });
                }
                FutureStatus::Faulted(error) => {
                    source.try_set_aggregate(error);
                }
                FutureStatus::Canceled => {
                    source.try_set_canceled();
                }
                FutureStatus::Pending => {}
            }
        });
        future
    }
}
//
impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}
//
impl<T: FutureValue> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Future")
         .field("id", &self.inner.id)
         .field("status", &self.kind())
         .finish()
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::coroutine::{from_fn, Step};
    use crate::scheduler::Scheduler;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Failure(&'static str);

    /// Continuations registered before and after completion both run once,
    /// on the same future, in registration order
    #[test]
    fn continuations_run_once() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let source = CompletionSource::<u32>::new(scheduler.handle());
        let future = source.future();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..2 {
            let log = log.clone();
            let id = future.id();
            future.add_continuation(move |f| {
                assert_eq!(f.id(), id);
                log.lock().push((tag, f.result().unwrap()));
            });
        }
        assert!(log.lock().is_empty());

        // Completion on the foreground thread delivers inline
        assert!(source.try_set_result(5));
        assert_eq!(*log.lock(), [(0, 5), (1, 5)]);

        // Late registrations also run inline, once
        let c_log = log.clone();
        future.add_continuation(move |f| c_log.lock().push((2, f.result().unwrap())));
        scheduler.drive().unwrap();
        assert_eq!(*log.lock(), [(0, 5), (1, 5), (2, 5)]);
    }

    /// Completions from other threads are delivered on the next tick
    #[test]
    fn cross_thread_delivery() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let source = CompletionSource::<u32>::new(scheduler.handle());
        let ran = Arc::new(AtomicUsize::new(0));
        let c_ran = ran.clone();
        source.future().add_continuation(move |f| {
            assert_eq!(f.result().unwrap(), 9);
            c_ran.fetch_add(1, Ordering::Relaxed);
        });

        let c_source = source.clone();
        thread::spawn(move || assert!(c_source.try_set_result(9))).join().unwrap();
        assert!(source.future().is_completed());
        assert_eq!(ran.load(Ordering::Relaxed), 0);

        scheduler.drive().unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    /// Continuations registered on the foreground thread while a cross-thread
    /// completion is still queued run after the queued ones
    #[test]
    fn late_continuations_keep_order() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let source = CompletionSource::<u32>::new(scheduler.handle());
        let future = source.future();
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |name: &'static str| {
            let order = order.clone();
            move |_: &Future<u32>| order.lock().push(name)
        };
        future.add_continuation(push("first"));

        let c_source = source.clone();
        thread::spawn(move || assert!(c_source.try_set_result(1))).join().unwrap();
        future.add_continuation(push("second"));
        assert!(order.lock().is_empty());

        scheduler.drive().unwrap();
        assert_eq!(*order.lock(), ["first", "second"]);

        // Once the queued batch is done, registrations run inline again
        future.add_continuation(push("third"));
        assert_eq!(*order.lock(), ["first", "second", "third"]);
    }

    /// Continuations registered by a running continuation run after it,
    /// within the same delivery
    #[test]
    fn reentrant_registration() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let future = Future::from_result(scheduler.handle(), 2u32);
        let order = Arc::new(Mutex::new(Vec::new()));
        let c_order = order.clone();
        future.add_continuation(move |f| {
            c_order.lock().push("outer start");
            let inner_order = c_order.clone();
            f.add_continuation(move |_| inner_order.lock().push("inner"));
            c_order.lock().push("outer end");
        });
        assert_eq!(*order.lock(), ["outer start", "outer end", "inner"]);
    }

    /// Reading the result is only allowed on successfully completed futures
    #[test]
    fn result_usage_errors() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();

        let pending = CompletionSource::<u32>::new(handle).future();
        assert!(matches!(pending.result(), Err(UsageError::NotCompleted)));
        assert!(!pending.is_completed());

        let faulted = Future::<u32>::from_exception(handle, Failure("A"));
        assert!(faulted.is_completed() && faulted.is_faulted());
        assert!(matches!(faulted.result(), Err(UsageError::Faulted(_))));
        assert_eq!(faulted.exception().unwrap().first().to_string(), "A");

        let canceled = Future::<u32>::from_canceled(handle);
        assert!(canceled.is_completed() && canceled.is_canceled());
        assert!(matches!(canceled.result(), Err(UsageError::Canceled)));
        assert!(canceled.exception().is_none());

        let completed = Future::from_result(handle, 3);
        assert!(completed.is_completed_successfully());
        assert_eq!(completed.result().unwrap(), 3);
    }

    /// Chained continuations see the antecedent and capture panics
    #[test]
    fn continue_with_chains() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();

        let next = Future::from_result(handle, 42).continue_with(|f| f.result().unwrap() + 1);
        assert_eq!(next.result().unwrap(), 43);

        let panicked = Future::from_result(handle, 0u32)
            .continue_with(|_| -> u32 { panic!("in continuation") });
        assert!(panicked.exception().unwrap().contains::<PanicError>());

        let failed = Future::from_result(handle, 0u32)
            .try_continue_with(|_| Err::<u32, _>(Failure("nope")));
        assert_eq!(failed.exception().unwrap().first().to_string(), "nope");
    }

    /// Success-only continuations propagate faults and cancellation
    #[test]
    fn on_success_propagation() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = |calls: &Arc<AtomicUsize>| {
            let calls = calls.clone();
            move |x: u32| {
                calls.fetch_add(1, Ordering::Relaxed);
                x * 2
            }
        };
        let doubled = Future::from_result(handle, 21).on_success(counted(&calls));
        assert_eq!(doubled.result().unwrap(), 42);

        let faulted = Future::<u32>::from_exception(handle, Failure("A"))
            .on_success(counted(&calls));
        assert_eq!(faulted.exception().unwrap().len(), 1);

        let canceled = Future::<u32>::from_canceled(handle).on_success(counted(&calls));
        assert!(canceled.is_canceled());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    /// Canceled continuations never run, and release their registration
    #[test]
    fn continuation_cancellation() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let source = CompletionSource::<u32>::new(scheduler.handle());
        let cancellation = CancellationSource::new();
        let token = cancellation.token();

        let next = source.future()
                         .continue_with_cancellation(&token, |_| -> u32 {
                             panic!("should not run")
                         });
        assert_eq!(token.pending_registrations(), 1);
        cancellation.cancel();
        assert!(next.is_canceled());
        assert!(source.try_set_result(1));
        assert!(next.is_canceled());

        // Completion disposes of the registration
        let other = CancellationSource::new();
        let token = other.token();
        let next = Future::from_result(scheduler.handle(), 1)
            .continue_with_cancellation(&token, |f| f.result().unwrap() + 1);
        assert_eq!(next.result().unwrap(), 2);
        assert_eq!(token.pending_registrations(), 0);
    }

    /// Flattening propagates the first failure at either level
    #[test]
    fn flatten_layers() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let handle = scheduler.handle();

        let outer = CompletionSource::<Future<u32>>::new(handle);
        let inner = CompletionSource::<u32>::new(handle);
        let flat = outer.future().flatten();
        assert!(outer.try_set_result(inner.future()));
        assert!(!flat.is_completed());
        assert!(inner.try_set_result(8));
        assert_eq!(flat.result().unwrap(), 8);

        let faulted_outer = Future::<Future<u32>>::from_exception(handle, Failure("outer"));
        assert!(faulted_outer.flatten().is_faulted());

        let canceled_inner = Future::from_result(handle, Future::<u32>::from_canceled(handle));
        assert!(canceled_inner.flatten().is_canceled());

        let chained = Future::from_result(handle, 1u32)
            .continue_with_future(|f| Future::from_result(f.scheduler(), f.result().unwrap() + 1));
        assert_eq!(chained.result().unwrap(), 2);
    }

    /// Coroutine continuations are driven by the scheduler
    #[test]
    fn coroutine_continuation() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let next = Future::from_result(scheduler.handle(), 10u32).continue_with_coroutine(|f| {
            let base = f.result().unwrap();
            let mut steps = 0;
            from_fn(move || {
                steps += 1;
                if steps == 2 { Step::Complete(base + steps) } else { Step::Yield }
            })
        });
        assert!(!next.is_completed());
        scheduler.drive().unwrap();
        assert!(!next.is_completed());
        scheduler.drive().unwrap();
        assert_eq!(next.result().unwrap(), 12);
    }

    /// A panicking raw continuation does not prevent the next ones from running
    #[test]
    fn continuation_panic_contained() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let source = CompletionSource::<u32>::new(scheduler.handle());
        let ran = Arc::new(AtomicUsize::new(0));
        source.future().add_continuation(|_| panic!("first continuation"));
        let c_ran = ran.clone();
        source.future().add_continuation(move |_| {
            c_ran.fetch_add(1, Ordering::Relaxed);
        });
        assert!(source.try_set_result(0));
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }
}
