//! Generator-style cooperative work
//!
//! A coroutine is a piece of work which the scheduler advances by one step per
//! tick, on the foreground thread. Each step either yields (try again next
//! tick), awaits a nested unit of work (do not step me again until it is
//! done), or completes with a final value.
//!
//! Awaiting never polls: a suspended coroutine is skipped by the scheduler
//! until the nested unit's completion resumes it.

use crate::error::AggregateError;
use crate::future::{Future, FutureValue};
use crate::scheduler::work::{ErasedWork, WorkCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread;


/// Callback used to resume a suspended coroutine
pub(crate) type Resume = Box<dyn FnOnce() + Send + 'static>;


/// Outcome of one coroutine step
pub enum Step<T> {
    /// Step again on the next tick
    Yield,

    /// Suspend until some nested unit of work is done
    Await(Nested),

    /// The coroutine is exhausted, with this final value
    Complete(T),
}
//
impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Step::Yield => write!(f, "Yield"),
            Step::Await(_) => write!(f, "Await(..)"),
            Step::Complete(_) => write!(f, "Complete(..)"),
        }
    }
}


/// Stepwise unit of work driven by the scheduler
pub trait Coroutine: Send + 'static {
    /// Final value produced when the coroutine is exhausted
    type Output: Send + 'static;

    /// Advance the coroutine by one step
    ///
    /// Will not be called again once a step has returned Step::Complete.
    ///
    fn resume(&mut self) -> Step<Self::Output>;

    /// Take over after a nested coroutine awaited by the last step failed
    ///
    /// The default unwinds with the nested coroutine's fault, which evicts
    /// this coroutine in turn and hands the fault over to whoever awaits it.
    /// Coroutines run through a TaskFactory end up with a faulted future.
    ///
    fn nested_failed(&mut self, error: AggregateError) -> Step<Self::Output> {
        panic::resume_unwind(Box::new(error))
    }
}


/// Nested unit of work which a coroutine can await
pub struct Nested {
    kind: NestedKind,
}
//
pub(crate) enum NestedKind {
    /// Another coroutine, registered as a child work item
    Work(Box<dyn FnOnce(Resume) -> Box<dyn ErasedWork> + Send>),

    /// A future, whose completion resumes the parent
    Future(Box<dyn FnOnce(Resume) + Send>),
}
//
impl Nested {
    /// Await another coroutine, discarding its final value
    pub fn coroutine<C: Coroutine>(coroutine: C) -> Self {
        Self {
            kind: NestedKind::Work(Box::new(move |resume: Resume| {
                let work: Box<dyn ErasedWork> = Box::new(
                    WorkCell::new(coroutine, move |_| resume())
                );
                work
            })),
        }
    }

    /// Await any terminal state of a future
    ///
    /// The awaiting coroutine is expected to inspect the future once resumed.
    ///
    pub fn future<T: FutureValue>(future: &Future<T>) -> Self {
        let future = future.clone();
        Self {
            kind: NestedKind::Future(Box::new(move |resume: Resume| {
                future.add_continuation(move |_| resume());
            })),
        }
    }

    pub(crate) fn into_kind(self) -> NestedKind {
        self.kind
    }
}


/// Coroutine built out of a closure, see from_fn()
pub struct FromFn<F> {
    step: F,
}
//
impl<T, F> Coroutine for FromFn<F>
    where F: FnMut() -> Step<T> + Send + 'static,
          T: Send + 'static
{
    type Output = T;

    fn resume(&mut self) -> Step<T> {
        (self.step)()
    }
}


/// Build a coroutine whose steps are successive calls to a closure
pub fn from_fn<T, F>(step: F) -> FromFn<F>
    where F: FnMut() -> Step<T> + Send + 'static,
          T: Send + 'static
{
    FromFn { step }
}


/// Coroutine adapter which turns panics into a faulted final value
pub(crate) struct CatchUnwind<C> {
    inner: C,
}
//
impl<C: Coroutine> CatchUnwind<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self { inner }
    }
}
//
impl<C: Coroutine> Coroutine for CatchUnwind<C> {
    type Output = Result<C::Output, AggregateError>;

    fn resume(&mut self) -> Step<Self::Output> {
        settle(panic::catch_unwind(AssertUnwindSafe(|| self.inner.resume())))
    }

    fn nested_failed(&mut self, error: AggregateError) -> Step<Self::Output> {
        settle(panic::catch_unwind(AssertUnwindSafe(|| self.inner.nested_failed(error))))
    }
}


/// Map a step which may have unwound to a step of CatchUnwind
fn settle<T>(step: thread::Result<Step<T>>) -> Step<Result<T, AggregateError>> {
    match step {
        Ok(Step::Yield) => Step::Yield,
        Ok(Step::Await(nested)) => Step::Await(nested),
        Ok(Step::Complete(output)) => Step::Complete(Ok(output)),
        Err(payload) => Step::Complete(Err(AggregateError::from_panic(payload))),
    }
}
