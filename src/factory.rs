//! Future factory
//!
//! A TaskFactory builds futures out of various kinds of work: closures run on
//! the foreground thread or on a thread pool, coroutines, timers and legacy
//! begin/end callback pairs. All the futures it builds are delivered by the
//! same scheduler, and observe the same default cancellation token.

use crate::background::PoolHandle;
use crate::cancel::{CancellationToken, Registration};
use crate::completion::{capture, run_coroutine, CompletionSource};
use crate::coroutine::{Coroutine, Step};
use crate::error::AggregateError;
use crate::future::{Future, FutureValue};
use crate::scheduler::SchedulerHandle;
use parking_lot::Mutex;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};


/// Builder of foreground futures
#[derive(Clone, Debug)]
pub struct TaskFactory {
    /// Scheduler delivering the futures
    scheduler: SchedulerHandle,

    /// Token observed by the operations which have no explicit one
    cancellation: CancellationToken,
}
//
impl TaskFactory {
    /// Factory whose operations cannot be canceled by default
    pub fn new(scheduler: &SchedulerHandle) -> Self {
        Self::with_cancellation(scheduler, CancellationToken::none())
    }

    /// Factory whose operations observe a default cancellation token
    pub fn with_cancellation(scheduler: &SchedulerHandle,
                             cancellation: CancellationToken) -> Self {
        Self {
            scheduler: scheduler.clone(),
            cancellation,
        }
    }

    /// Scheduler delivering the futures of this factory
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Default cancellation token of this factory
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Future which is already completed with some value
    pub fn from_result<T: FutureValue>(&self, value: T) -> Future<T> {
        Future::from_result(&self.scheduler, value)
    }

    /// Future which already failed with some error
    pub fn from_exception<T, E>(&self, error: E) -> Future<T>
        where T: FutureValue,
              E: Error + Send + Sync + 'static
    {
        Future::from_exception(&self.scheduler, error)
    }

    /// Future which already failed with a set of errors
    pub fn from_aggregate<T: FutureValue>(&self, error: AggregateError) -> Future<T> {
        Future::from_aggregate(&self.scheduler, error)
    }

    /// Future which is already canceled
    pub fn from_canceled<T: FutureValue>(&self) -> Future<T> {
        Future::from_canceled(&self.scheduler)
    }

    /// Run a closure on the foreground thread during the next tick
    ///
    /// The future is canceled, and the closure never runs, if the default
    /// token is canceled first. Panics fault the future.
    ///
    pub fn start_new<T, F>(&self, f: F) -> Future<T>
        where T: FutureValue,
              F: FnOnce() -> T + Send + 'static
    {
        self.post_outcome(move || capture(f))
    }

    /// Fallible version of start_new(), whose errors fault the future
    pub fn try_start_new<T, E, F>(&self, f: F) -> Future<T>
        where T: FutureValue,
              E: Error + Send + Sync + 'static,
              F: FnOnce() -> Result<T, E> + Send + 'static
    {
        self.post_outcome(move || {
            capture(f).and_then(|result| result.map_err(AggregateError::new))
        })
    }

    fn post_outcome<T, F>(&self, f: F) -> Future<T>
        where T: FutureValue,
              F: FnOnce() -> Result<T, AggregateError> + Send + 'static
    {
        let source = CompletionSource::new(&self.scheduler);
        let future = source.future();
        source.cancel_on(&self.cancellation);
        self.scheduler.post(move || {
            if !source.future().is_completed() {
                source.try_set_outcome(f());
            }
        });
        future
    }

    /// Run a closure on a thread pool, and deliver its outcome on the
    /// foreground thread
    pub fn start_background<T, F>(&self, pool: &PoolHandle, f: F) -> Future<T>
        where T: FutureValue,
              F: FnOnce() -> T + Send + 'static
    {
        pool.spawn_with_cancellation(f, &self.cancellation)
            .to_foreground(&self.scheduler, &self.cancellation)
    }

    /// Drive a coroutine on the scheduler, starting with the next tick
    ///
    /// Canceling the default token evicts the coroutine.
    ///
    pub fn start_coroutine<C>(&self, coroutine: C) -> Future<C::Output>
        where C: Coroutine,
              C::Output: FutureValue
    {
        self.start_coroutine_with_cancellation(coroutine, &self.cancellation)
    }

    /// Drive a coroutine on the scheduler, until it completes or the token
    /// is canceled
    pub fn start_coroutine_with_cancellation<C>(&self,
                                                coroutine: C,
                                                token: &CancellationToken)
                                                -> Future<C::Output>
        where C: Coroutine,
              C::Output: FutureValue
    {
        let source = CompletionSource::new(&self.scheduler);
        let future = source.future();
        source.cancel_on(token);
        if !future.is_completed() {
            run_coroutine(&self.scheduler, coroutine, source);
        }
        future
    }

    /// Future which completes on the first tick after some delay elapsed
    pub fn delay(&self, duration: Duration) -> Future<()> {
        self.delay_with_cancellation(duration, &self.cancellation)
    }

    /// Cancelable delay, whose future is canceled if the token fires first
    pub fn delay_with_cancellation(&self,
                                   duration: Duration,
                                   token: &CancellationToken) -> Future<()> {
        let deadline = Instant::now() + duration;
        self.start_coroutine_with_cancellation(Delay { deadline }, token)
    }

    /// Wrap a legacy operation made of a begin call, which receives a
    /// completion callback, and an end call which extracts the result
    pub fn from_async<R, T, E, B, End>(&self, begin: B, end: End) -> Future<T>
        where R: Send + 'static,
              T: FutureValue,
              E: Error + Send + Sync + 'static,
              B: FnOnce(AsyncCallback<R>) -> Result<(), E>,
              End: FnOnce(R) -> Result<T, E> + Send + 'static
    {
        self.from_async_with_cancellation(begin, end, &self.cancellation)
    }

    /// Cancelable version of from_async()
    ///
    /// If the token is already canceled, the begin call is not made at all.
    /// Otherwise, the token registration is disposed of as soon as the
    /// operation ends, whatever its outcome.
    ///
    pub fn from_async_with_cancellation<R, T, E, B, End>(&self,
                                                         begin: B,
                                                         end: End,
                                                         token: &CancellationToken)
                                                         -> Future<T>
        where R: Send + 'static,
              T: FutureValue,
              E: Error + Send + Sync + 'static,
              B: FnOnce(AsyncCallback<R>) -> Result<(), E>,
              End: FnOnce(R) -> Result<T, E> + Send + 'static
    {
        if token.is_canceled() {
            return self.from_canceled();
        }
        let source = CompletionSource::new(&self.scheduler);
        let future = source.future();

        // Register before beginning, as the callback may fire synchronously
        let registration = {
            let source = source.clone();
            token.register(move || {
                source.try_set_canceled();
            })
        };
        let registration = Arc::new(Mutex::new(Some(registration)));

        let callback = {
            let source = source.clone();
            let registration = registration.clone();
            AsyncCallback {
                complete: Box::new(move |result| {
                    let outcome = capture(move || end(result))
                        .and_then(|result| result.map_err(AggregateError::new));
                    dispose(&registration);
                    source.try_set_outcome(outcome);
                }),
            }
        };
        let began = capture(move || begin(callback))
            .and_then(|result| result.map_err(AggregateError::new));
        if let Err(error) = began {
            dispose(&registration);
            source.try_set_aggregate(error);
        }
        future
    }
}


/// Dispose of a shared registration, only the first call does anything
fn dispose(registration: &Mutex<Option<Registration>>) {
    let registration = registration.lock().take();
    if let Some(mut registration) = registration {
        registration.dispose();
    }
}


/// Completion callback handed to the begin call of from_async()
pub struct AsyncCallback<R> {
    complete: Box<dyn FnOnce(R) + Send + 'static>,
}
//
impl<R> AsyncCallback<R> {
    /// Signal that the operation ended, from any thread
    pub fn complete(self, result: R) {
        (self.complete)(result)
    }
}
//
impl<R> fmt::Debug for AsyncCallback<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncCallback").finish_non_exhaustive()
    }
}


/// Tick-driven timer
struct Delay {
    deadline: Instant,
}
//
impl Coroutine for Delay {
    type Output = ();

    fn resume(&mut self) -> Step<()> {
        if Instant::now() >= self.deadline {
            Step::Complete(())
        } else {
            Step::Yield
        }
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use crate::coroutine::{from_fn, Nested};
    use crate::error::PanicError;
    use crate::scheduler::Scheduler;
    use crate::status::StatusKind;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Failure(&'static str);

    /// A closure result and its continuation are both available after a
    /// single tick
    #[test]
    fn start_new_then_continue() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let factory = TaskFactory::new(scheduler.handle());
        let next = factory.start_new(|| 42).continue_with(|t| t.result().unwrap() + 1);
        assert!(!next.is_completed());
        scheduler.drive().unwrap();
        assert_eq!(next.result().unwrap(), 43);
    }

    /// Closure failures fault the future
    #[test]
    fn start_new_faults() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let factory = TaskFactory::new(scheduler.handle());
        let panicked = factory.start_new(|| -> u32 { panic!("oops") });
        let failed = factory.try_start_new(|| Err::<u32, _>(Failure("bad")));
        let fine = factory.try_start_new(|| Ok::<u32, Failure>(1));
        scheduler.drive().unwrap();
        assert!(panicked.exception().unwrap().contains::<PanicError>());
        assert_eq!(failed.exception().unwrap().first().to_string(), "bad");
        assert_eq!(fine.result().unwrap(), 1);
    }

    /// The default token cancels work which did not start yet
    #[test]
    fn default_cancellation() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let cancellation = CancellationSource::new();
        let factory = TaskFactory::with_cancellation(scheduler.handle(),
                                                     cancellation.token());
        let ran = Arc::new(AtomicUsize::new(0));
        let c_ran = ran.clone();
        let future = factory.start_new(move || {
            c_ran.fetch_add(1, Ordering::Relaxed);
        });
        cancellation.cancel();
        scheduler.drive().unwrap();
        assert!(future.is_canceled());
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    /// Coroutines complete their future with their final value
    #[test]
    fn coroutine_future() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let factory = TaskFactory::new(scheduler.handle());
        let mut step = 0;
        let future = factory.start_coroutine(from_fn(move || {
            step += 1;
            if step == 3 { Step::Complete("third") } else { Step::Yield }
        }));
        scheduler.drive().unwrap();
        scheduler.drive().unwrap();
        assert!(!future.is_completed());
        scheduler.drive().unwrap();
        assert_eq!(future.result().unwrap(), "third");

        let panicked = factory.start_coroutine(from_fn(|| -> Step<u32> {
            panic!("bad step")
        }));
        scheduler.drive().unwrap();
        assert!(panicked.is_faulted());
    }

    /// Panics in nested coroutines fault the future of the outer coroutine
    #[test]
    fn nested_coroutine_panic_faults() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let factory = TaskFactory::new(scheduler.handle());
        let future = factory.start_coroutine(from_fn(|| -> Step<u32> {
            Step::Await(Nested::coroutine(from_fn(|| -> Step<()> { panic!("child") })))
        }));
        for _ in 0..3 {
            scheduler.drive().unwrap();
        }
        let error = future.exception().unwrap();
        assert!(error.contains::<PanicError>());
        assert_eq!(error.first().to_string(), "panicked: child");
        let stats = scheduler.drive().unwrap();
        assert_eq!((stats.active_work, stats.suspended_work), (0, 0));
    }

    /// Elapsed delays complete on the next tick, canceled ones are canceled
    #[test]
    fn delays() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let factory = TaskFactory::new(scheduler.handle());
        let elapsed = factory.delay(Duration::ZERO);
        let cancellation = CancellationSource::new();
        let long = factory.delay_with_cancellation(Duration::from_secs(3600),
                                                   &cancellation.token());
        scheduler.drive().unwrap();
        assert_eq!(elapsed.kind(), StatusKind::Completed);
        assert!(!long.is_completed());

        cancellation.cancel();
        assert!(long.is_canceled());
        let stats = scheduler.drive().unwrap();
        assert_eq!(stats.active_work, 0);
    }

    /// Legacy operations completing from another thread
    #[test]
    fn from_async_completes() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let cancellation = CancellationSource::new();
        let factory = TaskFactory::with_cancellation(scheduler.handle(),
                                                     cancellation.token());
        let future = factory.from_async(
            |callback: AsyncCallback<u32>| -> Result<(), Failure> {
                thread::spawn(move || callback.complete(20));
                Ok(())
            },
            |raw| Ok::<u32, Failure>(raw + 1),
        );
        while !future.is_completed() {
            thread::yield_now();
        }
        assert_eq!(future.result().unwrap(), 21);
        assert_eq!(cancellation.token().pending_registrations(), 0);
    }

    /// Legacy operations which fail to begin or end fault their future
    #[test]
    fn from_async_faults() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let factory = TaskFactory::new(scheduler.handle());
        let not_begun = factory.from_async(
            |_: AsyncCallback<u32>| Err(Failure("begin")),
            Ok::<u32, Failure>,
        );
        assert_eq!(not_begun.exception().unwrap().first().to_string(), "begin");

        let not_ended = factory.from_async(
            |callback: AsyncCallback<u32>| {
                callback.complete(0);
                Ok(())
            },
            |_| Err::<u32, _>(Failure("end")),
        );
        assert_eq!(not_ended.exception().unwrap().first().to_string(), "end");
    }

    /// A canceled token prevents the operation from beginning
    #[test]
    fn from_async_precanceled() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let cancellation = CancellationSource::new();
        cancellation.cancel();
        let factory = TaskFactory::new(scheduler.handle());
        let future = factory.from_async_with_cancellation(
            |_: AsyncCallback<u32>| -> Result<(), Failure> { panic!("began") },
            Ok::<u32, Failure>,
            &cancellation.token(),
        );
        assert!(future.is_canceled());
    }

    /// Canceling a running legacy operation cancels its future, and the late
    /// completion has no effect
    #[test]
    fn from_async_canceled_midway() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let cancellation = CancellationSource::new();
        let factory = TaskFactory::with_cancellation(scheduler.handle(),
                                                     cancellation.token());
        let pending = Arc::new(Mutex::new(None));
        let c_pending = pending.clone();
        let future = factory.from_async(
            move |callback: AsyncCallback<u32>| -> Result<(), Failure> {
                *c_pending.lock() = Some(callback);
                Ok(())
            },
            Ok::<u32, Failure>,
        );
        assert_eq!(cancellation.token().pending_registrations(), 1);
        cancellation.cancel();
        assert!(future.is_canceled());

        let callback = pending.lock().take().unwrap();
        callback.complete(5);
        assert!(future.is_canceled());
    }
}
