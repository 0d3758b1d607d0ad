//! Foreground scheduler
//!
//! The scheduler is the sole authority over foreground execution. It is
//! created on the foreground thread, and must then be driven by the host, which
//! calls `Scheduler::drive()` once per tick (e.g. once per rendered frame).
//! Nothing else drains the cross-thread queue or advances coroutines.
//!
//! Each tick does two things, in this order:
//!
//! 1. Execute up to `SchedulerConfig::queue_budget` messages posted from any
//!    thread, in FIFO order. Messages which do not fit in the budget stay in
//!    the queue, in order, for the next tick.
//! 2. Step every active work item once. A step which awaits a nested unit of
//!    work suspends its item until that unit completes. A step which completes
//!    removes the item from the registry, then calls its completion callback.
//!
//! Other components talk to the scheduler through cheap, cloneable and
//! thread-safe SchedulerHandles.

pub(crate) mod queue;
pub mod stats;
pub(crate) mod work;

pub use self::stats::{SchedulerStats, StatsMonitor};
pub use self::work::{WorkId, WorkStatus};

use self::queue::{EventLoopQueue, Message, SendSignal, SignalState};
use self::stats::StatsPublisher;
use self::work::{ErasedStep, ErasedWork, WorkCell, WorkRegistry};
use crate::config::SchedulerConfig;
use crate::coroutine::{Coroutine, Nested, NestedKind};
use crate::error::{AggregateError, PanicError, SendError, UsageError};
use crate::executor::{CallbackExecutor, InlineExecutor, Job};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace, warn};


/// State shared between the scheduler and its handles
struct Shared {
    /// Thread on which the scheduler was created, and must be driven
    foreground: ThreadId,

    /// Scheduler configuration
    config: SchedulerConfig,

    /// Messages posted from any thread
    queue: EventLoopQueue,

    /// Coroutines being driven
    work: WorkRegistry,

    /// End-of-tick statistics are published through this
    publisher: Mutex<StatsPublisher>,

    /// Polling side of the statistics, until someone takes it
    monitor: Mutex<Option<StatsMonitor>>,

    /// Number of completed ticks
    ticks: AtomicU64,
}


/// Owner of the foreground thread
///
/// Dropping the scheduler shuts it down.
///
pub struct Scheduler {
    handle: SchedulerHandle,
}
//
impl Scheduler {
    /// Create a scheduler bound to the current thread, with default settings
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler bound to the current thread
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        config.normalize();
        let (publisher, monitor) = stats::channel();
        let foreground = thread::current().id();
        debug!(?foreground, queue_budget = config.queue_budget,
               "foreground scheduler created");
        Self {
            handle: SchedulerHandle {
                shared: Arc::new(Shared {
                    foreground,
                    config,
                    queue: EventLoopQueue::new(),
                    work: WorkRegistry::new(),
                    publisher: Mutex::new(publisher),
                    monitor: Mutex::new(Some(monitor)),
                    ticks: AtomicU64::new(0),
                }),
            },
        }
    }

    /// Handle through which other components reach this scheduler
    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    /// Run one tick of the event loop
    ///
    /// Must be called from the foreground thread, i.e. the thread on which the
    /// scheduler was created.
    ///
    pub fn drive(&self) -> Result<SchedulerStats, UsageError> {
        let shared = &self.handle.shared;
        if !self.handle.is_foreground() {
            return Err(UsageError::NotForeground);
        }
        if shared.queue.is_closed() {
            return Err(UsageError::SchedulerClosed);
        }

        // Drain the queue first, then advance coroutines
        let drained = self.handle.drain_queue();
        let stepped = self.handle.step_work_items();

        // Report on what happened
        let ticks = shared.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let (active_work, suspended_work) = shared.work.counts();
        let stats = SchedulerStats {
            ticks,
            drained,
            backlog: shared.queue.len(),
            stepped,
            active_work,
            suspended_work,
        };
        if stats.backlog > shared.config.queue_budget {
            warn!(backlog = stats.backlog, budget = shared.config.queue_budget,
                  "message backlog exceeds the per-tick budget");
        }
        trace!(ticks, drained, stepped, backlog = stats.backlog, "tick done");
        shared.publisher.lock().publish(stats.clone());
        Ok(stats)
    }

    /// Stop accepting work, and discard everything which is pending
    ///
    /// Blocked senders are released with an error. Futures which were waiting
    /// for discarded work stay pending forever.
    ///
    pub fn shutdown(&self) {
        let pending = self.handle.shared.queue.close();
        let evicted = self.handle.shared.work.clear();
        if !pending.is_empty() || !evicted.is_empty() {
            debug!(messages = pending.len(), work_items = evicted.len(),
                   "discarding pending work on shutdown");
        }

        // Dropping user closures may post messages, which are now refused
        drop(pending);
        drop(evicted);
    }
}
//
impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
//
impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
//
impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler").field("handle", &self.handle).finish()
    }
}


/// Thread-safe interface to a Scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}
//
impl SchedulerHandle {
    /// Check if the calling thread is the foreground thread
    pub fn is_foreground(&self) -> bool {
        thread::current().id() == self.shared.foreground
    }

    /// Check if the scheduler was shut down
    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed()
    }

    /// Enqueue an action, to be executed by the foreground thread on a later
    /// tick. Can be called from any thread.
    pub fn post<F>(&self, action: F)
        where F: FnOnce() + Send + 'static
    {
        self.enqueue(Message::post(Box::new(action)));
    }

    /// Enqueue an action, and block until the foreground thread executed it
    ///
    /// Calling this from the foreground thread would wait forever, and is
    /// reported as a usage error instead.
    ///
    pub fn send<F>(&self, action: F) -> Result<(), SendError>
        where F: FnOnce() + Send + 'static
    {
        if self.is_foreground() {
            warn!("blocking send attempted from the foreground thread");
            return Err(UsageError::SendFromForeground.into());
        }
        let signal = Arc::new(SendSignal::new());
        self.enqueue(Message::send(Box::new(action), signal.clone()));
        signal.wait()
    }

    /// Register a coroutine, to be stepped once per tick starting with the
    /// next one. The completion callback receives its final value.
    pub fn post_coroutine<C, F>(&self, coroutine: C, on_complete: F) -> WorkHandle
        where C: Coroutine,
              F: FnOnce(C::Output) + Send + 'static
    {
        let id = self.shared.work.allocate_id();
        if self.is_closed() {
            debug!(%id, "scheduler closed, discarding work item");
        } else {
            self.shared.work.insert(id, Box::new(WorkCell::new(coroutine, on_complete)));
            debug!(%id, "work item registered");
        }
        WorkHandle { id, scheduler: self.clone() }
    }

    /// Evict a work item, so that it is never stepped again and its completion
    /// callback never runs. Returns false if it was already done.
    ///
    /// If another work item awaits the canceled one, it is resumed.
    ///
    pub fn cancel(&self, id: WorkId) -> bool {
        let canceled = self.evict(id, None);
        if canceled {
            debug!(%id, "work item canceled");
        }
        canceled
    }

    /// Current status of a work item
    pub fn work_status(&self, id: WorkId) -> WorkStatus {
        self.shared.work.status(id)
    }

    /// Take the polling interface to the scheduler's statistics
    ///
    /// There is only one such interface, later calls return None.
    ///
    pub fn take_stats_monitor(&self) -> Option<StatsMonitor> {
        self.shared.monitor.lock().take()
    }

    /// Executor implementing the continuation delivery rule for the calling
    /// thread: inline on the foreground thread, queued from anywhere else
    pub(crate) fn delivery_executor(&self) -> &dyn CallbackExecutor {
        if self.is_foreground() {
            &InlineExecutor
        } else {
            self
        }
    }

    fn enqueue(&self, message: Message) {
        if let Err(message) = self.shared.queue.push(message) {
            trace!("scheduler closed, discarding message");
            drop(message);
        }
    }

    /// Execute queued messages, within the per-tick budget
    fn drain_queue(&self) -> usize {
        let budget = self.shared.config.queue_budget;
        let mut drained = 0;
        while drained < budget {
            let Some(message) = self.shared.queue.pop() else {
                break;
            };
            drained += 1;

            let (action, signal) = message.into_parts();
            let Some(action) = action else {
                continue;
            };
            let outcome = match panic::catch_unwind(AssertUnwindSafe(action)) {
                Ok(()) => SignalState::Executed,
                Err(payload) => {
                    let error = PanicError::from_payload(&*payload);
                    error!(%error, "posted action panicked");
                    SignalState::Panicked(error)
                }
            };
            if let Some(signal) = signal {
                signal.finish(outcome);
            }
        }
        drained
    }

    /// Step every active work item once
    fn step_work_items(&self) -> usize {
        let work = &self.shared.work;
        let mut stepped = 0;
        for id in work.ids() {
            let Some((mut body, fault)) = work.begin_step(id) else {
                continue;
            };
            stepped += 1;

            let step = panic::catch_unwind(AssertUnwindSafe(|| match fault {
                Some(error) => body.fail(error),
                None => body.step(),
            }));
            match step {
                Ok(ErasedStep::Yielded) => {
                    // Canceled mid-step items are handed back, and dropped here
                    let _ = work.end_step(id, body, WorkStatus::Active);
                }
                Ok(ErasedStep::Await(nested)) => self.suspend(id, body, nested),
                Ok(ErasedStep::Finished(on_complete)) => {
                    drop(body);
                    if work.finish(id) {
                        debug!(%id, "work item done");
                        run_contained(on_complete);
                    }
                }
                Err(payload) => {
                    let error = AggregateError::from_panic(payload);
                    error!(%id, %error, "work item panicked, evicting it");
                    drop(body);
                    self.evict(id, Some(error));
                }
            }
        }
        stepped
    }

    /// Suspend a work item until a nested unit of work is done
    fn suspend(&self, id: WorkId, body: Box<dyn ErasedWork>, nested: Nested) {
        let work = &self.shared.work;
        match nested.into_kind() {
            NestedKind::Work(build) => {
                let child = work.allocate_id();
                let status = WorkStatus::Suspended { awaiting: Some(child) };
                if work.end_step(id, body, status).is_err() {
                    return;
                }
                let handle = self.clone();
                work.insert(child, build(Box::new(move || {
                    handle.resume(id);
                })));
                debug!(parent = %id, %child, "work item awaits a nested work item");
            }
            NestedKind::Future(register) => {
                let status = WorkStatus::Suspended { awaiting: None };
                if work.end_step(id, body, status).is_err() {
                    return;
                }
                let handle = self.clone();
                register(Box::new(move || {
                    handle.resume(id);
                }));
                trace!(%id, "work item awaits a future");
            }
        }
    }

    /// Remove a work item, then wake up the work item awaiting it, if any,
    /// handing it the failure of the removed item
    fn evict(&self, id: WorkId, failure: Option<AggregateError>) -> bool {
        let work = &self.shared.work;
        let parent = work.parent_of(id);
        let Some(evicted) = work.remove(id) else {
            return false;
        };
        drop(evicted);
        match (parent, failure) {
            (Some(parent), Some(error)) => {
                if work.fail(parent, error) {
                    debug!(%parent, child = %id, "nested work item failed");
                }
            }
            (Some(parent), None) => self.resume(parent),
            (None, _) => {}
        }
        true
    }

    /// Make a suspended work item active again
    fn resume(&self, id: WorkId) {
        if self.shared.work.resume(id) {
            trace!(%id, "work item resumed");
        }
    }
}
//
impl CallbackExecutor for SchedulerHandle {
    fn execute(&self, job: Job) {
        self.enqueue(Message::post(job));
    }
}
//
impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
         .field("foreground", &self.shared.foreground)
         .field("closed", &self.is_closed())
         .finish()
    }
}


/// Run a completion callback, logging rather than propagating its panics
fn run_contained(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let error = PanicError::from_payload(&*payload);
        error!(%error, "work item completion callback panicked");
    }
}


/// Handle to a work item registered on the scheduler
#[derive(Clone)]
pub struct WorkHandle {
    id: WorkId,
    scheduler: SchedulerHandle,
}
//
impl WorkHandle {
    /// Identifier of the work item
    pub fn id(&self) -> WorkId {
        self.id
    }

    /// Current status of the work item
    pub fn status(&self) -> WorkStatus {
        self.scheduler.work_status(self.id)
    }

    /// Evict the work item, see SchedulerHandle::cancel()
    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(self.id)
    }
}
//
impl fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkHandle")
         .field("id", &self.id)
         .field("status", &self.status())
         .finish()
    }
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::{from_fn, Step};
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Coroutine which completes with `value` on its `steps`-th step
    fn counting(steps: usize, value: u32) -> impl Coroutine<Output = u32> {
        let mut taken = 0;
        from_fn(move || {
            taken += 1;
            if taken == steps { Step::Complete(value) } else { Step::Yield }
        })
    }

    /// Posted actions run on the next tick, in FIFO order
    #[test]
    fn post_runs_on_drive() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            scheduler.handle().post(move || log.lock().push(i));
        }
        assert!(log.lock().is_empty());

        let stats = scheduler.drive().unwrap();
        assert_eq!(*log.lock(), [0, 1, 2]);
        assert_eq!(stats.drained, 3);
        assert_eq!(stats.ticks, 1);
    }

    /// The per-tick budget leaves the rest of the queue for later ticks,
    /// without reordering it
    #[test]
    fn queue_budget() {
        init_test_logging();
        let config = SchedulerConfig::default().with_queue_budget(2);
        let scheduler = Scheduler::with_config(config);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            scheduler.handle().post(move || log.lock().push(i));
        }

        let stats = scheduler.drive().unwrap();
        assert_eq!((stats.drained, stats.backlog), (2, 3));
        assert_eq!(*log.lock(), [0, 1]);

        scheduler.drive().unwrap();
        scheduler.drive().unwrap();
        assert_eq!(*log.lock(), [0, 1, 2, 3, 4]);
    }

    /// A three-step coroutine completes during the third tick, exactly once
    #[test]
    fn three_step_coroutine() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        let c_results = results.clone();
        let work = scheduler.handle().post_coroutine(counting(3, 7), move |value| {
            c_results.lock().push(value);
        });

        scheduler.drive().unwrap();
        scheduler.drive().unwrap();
        assert!(results.lock().is_empty());
        assert_eq!(work.status(), WorkStatus::Active);

        scheduler.drive().unwrap();
        assert_eq!(*results.lock(), [7]);
        assert_eq!(work.status(), WorkStatus::Done);

        scheduler.drive().unwrap();
        assert_eq!(*results.lock(), [7]);
    }

    /// Canceled work items are never stepped nor completed
    #[test]
    fn cancel_evicts() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let c_completed = completed.clone();
        let work = scheduler.handle().post_coroutine(counting(2, 0), move |_| {
            c_completed.fetch_add(1, Ordering::Relaxed);
        });

        scheduler.drive().unwrap();
        assert!(work.cancel());
        assert!(!work.cancel());
        for _ in 0..3 {
            scheduler.drive().unwrap();
        }
        assert_eq!(completed.load(Ordering::Relaxed), 0);
        assert_eq!(work.status(), WorkStatus::Done);
    }

    /// A coroutine awaiting a nested coroutine is suspended until that one
    /// completes, and is not stepped meanwhile
    #[test]
    fn nested_coroutine() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let parent_steps = Arc::new(AtomicUsize::new(0));
        let c_parent_steps = parent_steps.clone();
        let mut awaited = false;
        let parent = from_fn(move || {
            c_parent_steps.fetch_add(1, Ordering::Relaxed);
            if awaited {
                Step::Complete("parent done")
            } else {
                awaited = true;
                Step::Await(Nested::coroutine(counting(2, 0)))
            }
        });
        let result = Arc::new(Mutex::new(None));
        let c_result = result.clone();
        let work = scheduler.handle().post_coroutine(parent, move |value| {
            *c_result.lock() = Some(value);
        });

        // Tick 1: the parent suspends, the child is registered
        let stats = scheduler.drive().unwrap();
        assert!(matches!(work.status(), WorkStatus::Suspended { awaiting: Some(_) }));
        assert_eq!((stats.active_work, stats.suspended_work), (1, 1));

        // Tick 2 and 3: the child steps and completes, resuming the parent
        scheduler.drive().unwrap();
        scheduler.drive().unwrap();
        assert_eq!(parent_steps.load(Ordering::Relaxed), 1);
        assert_eq!(work.status(), WorkStatus::Active);

        // Tick 4: the parent completes
        scheduler.drive().unwrap();
        assert_eq!(parent_steps.load(Ordering::Relaxed), 2);
        assert_eq!(*result.lock(), Some("parent done"));
    }

    /// Canceling a suspended parent also evicts the child it awaits
    #[test]
    fn cancel_nested() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let parent = from_fn(|| -> Step<()> {
            Step::Await(Nested::coroutine(counting(usize::MAX, 0)))
        });
        let work = scheduler.handle().post_coroutine(parent, |_| {});
        let stats = scheduler.drive().unwrap();
        assert_eq!(stats.active_work + stats.suspended_work, 2);

        assert!(work.cancel());
        let stats = scheduler.drive().unwrap();
        assert_eq!(stats.active_work + stats.suspended_work, 0);
    }

    /// Canceling the awaited child resumes its parent
    #[test]
    fn cancel_child_resumes_parent() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let mut awaited = false;
        let parent = from_fn(move || {
            if awaited {
                Step::Complete(1u32)
            } else {
                awaited = true;
                Step::Await(Nested::coroutine(counting(usize::MAX, 0)))
            }
        });
        let result = Arc::new(Mutex::new(None));
        let c_result = result.clone();
        let work = scheduler.handle().post_coroutine(parent, move |value| {
            *c_result.lock() = Some(value);
        });
        scheduler.drive().unwrap();
        let WorkStatus::Suspended { awaiting: Some(child) } = work.status() else {
            panic!("parent should await its child, got {:?}", work.status());
        };

        assert!(scheduler.handle().cancel(child));
        assert_eq!(work.status(), WorkStatus::Active);
        scheduler.drive().unwrap();
        assert_eq!(*result.lock(), Some(1));
        assert_eq!(work.status(), WorkStatus::Done);
    }

    /// A panicking child takes down the parent awaiting it, by default
    #[test]
    fn nested_panic_evicts_parent() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let parent = from_fn(|| -> Step<u32> {
            Step::Await(Nested::coroutine(from_fn(|| -> Step<()> { panic!("child") })))
        });
        let work = scheduler.handle().post_coroutine(parent, |_| panic!("never completes"));

        // Tick 1 suspends the parent, tick 2 fails the child
        scheduler.drive().unwrap();
        scheduler.drive().unwrap();
        assert_eq!(work.status(), WorkStatus::Active);

        // Tick 3 hands the failure over to the parent
        let stats = scheduler.drive().unwrap();
        assert_eq!(stats.stepped, 1);
        assert_eq!(work.status(), WorkStatus::Done);
        assert_eq!((stats.active_work, stats.suspended_work), (0, 0));
    }

    /// Panicking actions and steps are contained
    #[test]
    fn panics_are_contained() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler.handle().post(|| panic!("bad action"));
        let c_ran = ran.clone();
        scheduler.handle().post(move || {
            c_ran.fetch_add(1, Ordering::Relaxed);
        });
        let work = scheduler.handle().post_coroutine(
            from_fn(|| -> Step<()> { panic!("bad step") }),
            |_| panic!("never completes"),
        );

        let stats = scheduler.drive().unwrap();
        assert_eq!(stats.drained, 2);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(work.status(), WorkStatus::Done);
    }

    /// Blocking sends are released once the action has run
    #[test]
    fn send_from_background() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let handle = scheduler.handle().clone();
        let value = Arc::new(AtomicUsize::new(0));
        let c_value = value.clone();
        let sender = thread::spawn(move || {
            handle.send(move || c_value.store(42, Ordering::Relaxed))
        });

        // Keep ticking until the sender got through
        while !sender.is_finished() {
            scheduler.drive().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(sender.join().unwrap().is_ok());
        assert_eq!(value.load(Ordering::Relaxed), 42);
    }

    /// Sending from the foreground thread is refused instead of deadlocking
    #[test]
    fn send_from_foreground() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let result = scheduler.handle().send(|| {});
        assert!(matches!(result, Err(SendError::Usage(UsageError::SendFromForeground))));
    }

    /// Only the foreground thread may drive the scheduler
    #[test]
    fn drive_from_background() {
        init_test_logging();
        let scheduler = Arc::new(Scheduler::new());
        let c_scheduler = scheduler.clone();
        let result = thread::spawn(move || c_scheduler.drive().map(|_| ()))
                         .join()
                         .unwrap();
        assert!(matches!(result, Err(UsageError::NotForeground)));
    }

    /// Shutting down releases blocked senders and refuses new work
    #[test]
    fn shutdown() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let handle = scheduler.handle().clone();
        let sender = {
            let handle = handle.clone();
            thread::spawn(move || handle.send(|| {}))
        };
        while scheduler.handle().shared.queue.len() == 0 {
            thread::yield_now();
        }
        drop(scheduler);

        assert!(matches!(sender.join().unwrap(),
                         Err(SendError::Usage(UsageError::SchedulerClosed))));
        assert!(handle.is_closed());
        let work = handle.post_coroutine(counting(1, 0), |_| {});
        assert_eq!(work.status(), WorkStatus::Done);
    }

    /// Statistics can be polled after each tick
    #[test]
    fn stats_monitor() {
        init_test_logging();
        let scheduler = Scheduler::new();
        let mut monitor = scheduler.handle().take_stats_monitor().unwrap();
        assert!(scheduler.handle().take_stats_monitor().is_none());

        scheduler.handle().post(|| {});
        scheduler.drive().unwrap();
        assert_eq!(monitor.stats().ticks, 1);
        assert_eq!(monitor.stats().drained, 1);
    }
}
