//! Foreground-bound asynchronous operations
//!
//! Picture yourself in a situation where: your application runs inside a host
//! which owns one "foreground" thread and calls into your code once per tick,
//! for example once per rendered frame. You would like to start work in the
//! background, on timers, or as stepwise coroutines, and learn about its
//! outcome without ever blocking the foreground thread. But you would also
//! like every reaction to that outcome to run on the foreground thread, since
//! that is the only place where the host lets you touch its state.
//!
//! This crate provides the machinery for this:
//!
//! - A [`Future`] represents the eventual outcome of one unit of work. It ends
//!   up in exactly one terminal state (completed, faulted or canceled), and
//!   runs its continuations exactly once, in registration order.
//! - A [`CompletionSource`] is the only handle allowed to push a future into
//!   its terminal state.
//! - A [`Scheduler`] owns the foreground thread. It drains messages posted
//!   from other threads and steps suspended [`Coroutine`]s whenever the host
//!   calls [`Scheduler::drive()`].
//! - A [`TaskFactory`] builds futures out of closures, coroutines, timers,
//!   legacy begin/end callback pairs and other futures.
//! - The [`background`] module and the bridge methods on [`Future`] and
//!   [`BackgroundTask`] connect the foreground world to a thread pool.
//!
//! There is no global state: everything hangs off a scheduler, which is
//! created by the host on the thread that will later drive it.

pub mod background;
pub mod bridge;
pub mod cancel;
pub mod combinator;
pub mod completion;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod executor;
pub mod factory;
pub mod future;
pub mod scheduler;
pub mod status;

#[cfg(test)]
mod test_utils;

pub use background::{BackgroundCompleter, BackgroundError, BackgroundOp, BackgroundOutcome,
                     BackgroundStatus, BackgroundTask, PoolHandle, TaskDiagnostic, ThreadPool};
pub use cancel::{CancellationSource, CancellationToken, Registration};
pub use completion::CompletionSource;
pub use config::{PoolConfig, SchedulerConfig};
pub use coroutine::{Coroutine, Nested, Step};
pub use error::{AggregateError, Cause, PanicError, SendError, UsageError};
pub use factory::{AsyncCallback, TaskFactory};
pub use future::{Future, FutureValue};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats, StatsMonitor, WorkHandle, WorkId, WorkStatus};
pub use status::{FutureStatus, StatusKind};
