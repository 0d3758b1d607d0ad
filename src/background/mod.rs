//! Background operations
//!
//! This module provides the host-side representation of work which runs on a
//! thread pool, outside of the foreground scheduler's control. A background
//! operation is split into a completer, which is handed to the thread doing
//! the work, and a task, which other threads can use to monitor it.
//!
//! Tasks can be monitored in two ways:
//!
//! - Blocking allows a thread to wait for the operation to end. Although easy
//!   to use and reason about, this should be used sparingly, and never on the
//!   foreground thread, as it can stall the host.
//! - Callbacks allow a client to schedule code which runs on the completing
//!   thread once the operation has ended. This is what the bridges to
//!   foreground futures are built upon.
//!
//! A completer which is dropped without reporting an outcome ends its task
//! with a diagnostic, so that waiters never hang and the failure is never
//! silently lost.

pub mod pool;

pub use self::pool::{PoolHandle, ThreadPool};

use crate::error::AggregateError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;


/// Source of process-unique background task identifiers
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);


/// Lifecycle of a background operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackgroundStatus {
    /// The operation was created, but no thread picked it up yet
    Created,

    /// A thread is working on the operation
    Running,

    /// The operation produced a value
    RanToCompletion,

    /// The operation failed, or ended without producing anything
    Faulted,

    /// The operation was canceled
    Canceled,
}
//
impl BackgroundStatus {
    /// Check if the status is final (i.e. won't change anymore)
    pub fn is_final(self) -> bool {
        matches!(self,
                 BackgroundStatus::RanToCompletion
                 | BackgroundStatus::Faulted
                 | BackgroundStatus::Canceled)
    }
}


/// Description of an operation which ended without a value nor an error
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("task {id} ended without a value (faulted: {faulted}, canceled: {canceled}, \
         status: {status:?})")]
pub struct TaskDiagnostic {
    /// Identifier of the operation
    pub id: u64,

    /// Whether the operation had faulted
    pub faulted: bool,

    /// Whether the operation had been canceled
    pub canceled: bool,

    /// Last known status of the operation
    pub status: BackgroundStatus,
}


/// Ways in which a background operation can fail to produce a value
#[derive(Clone, Debug, Error)]
pub enum BackgroundError {
    /// The operation failed
    #[error("background operation faulted")]
    Faulted(#[source] AggregateError),

    /// The operation was canceled
    #[error("background operation was canceled")]
    Canceled,

    /// The operation ended without reporting anything
    #[error(transparent)]
    NoValue(TaskDiagnostic),
}


/// Final outcome of a background operation
pub type BackgroundOutcome<T> = Result<T, BackgroundError>;


/// Callback run when a background operation ends
type Callback<T> = Box<dyn FnOnce(&BackgroundOutcome<T>) + Send + 'static>;


/// Background operation object
pub struct BackgroundOp<T: Clone + Send + 'static> {
    /// Producer interface, used to report the outcome
    completer: BackgroundCompleter<T>,

    /// Client interface, used to monitor the operation
    task: BackgroundTask<T>,
}
//
impl<T: Clone + Send + 'static> BackgroundOp<T> {
    /// Create a new background operation, in the Created state
    pub fn new() -> Self {
        let shared = Arc::new(SharedState {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TaskState {
                status: BackgroundStatus::Created,
                outcome: None,
                callbacks: Vec::new(),
            }),
            update_cv: Condvar::new(),
        });
        Self {
            completer: BackgroundCompleter { shared: shared.clone(), done: false },
            task: BackgroundTask { shared },
        }
    }

    /// Split the operation object into completer and task objects, which can
    /// be respectively sent to the worker and client threads
    pub fn split(self) -> (BackgroundCompleter<T>, BackgroundTask<T>) {
        (self.completer, self.task)
    }
}
//
impl<T: Clone + Send + 'static> Default for BackgroundOp<T> {
    fn default() -> Self {
        Self::new()
    }
}


/// Producer interface, used to report the outcome of a background operation
pub struct BackgroundCompleter<T: Clone + Send + 'static> {
    /// Reference-counted shared state
    shared: Arc<SharedState<T>>,

    /// Whether an outcome was reported already
    done: bool,
}
//
impl<T: Clone + Send + 'static> BackgroundCompleter<T> {
    /// Identifier of the operation
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Signal that a thread started working on the operation
    pub fn mark_running(&self) {
        let mut state = self.shared.state.lock();
        if state.status == BackgroundStatus::Created {
            state.status = BackgroundStatus::Running;
        }
    }

    /// Report the outcome of the operation
    ///
    /// Only the first report has an effect, and returns true. Callbacks run
    /// on the calling thread.
    ///
    pub fn complete(&mut self, outcome: BackgroundOutcome<T>) -> bool {
        if self.done {
            return false;
        }
        self.done = true;

        let status = match &outcome {
            Ok(_) => BackgroundStatus::RanToCompletion,
            Err(BackgroundError::Canceled) => BackgroundStatus::Canceled,
            Err(_) => BackgroundStatus::Faulted,
        };
        let callbacks = {
            let mut state = self.shared.state.lock();
            state.status = status;
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.shared.update_cv.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }
}
//
impl<T: Clone + Send + 'static> Drop for BackgroundCompleter<T> {
    /// If the completer is dropped before reporting an outcome, end the
    /// operation with a diagnostic in order to prevent clients from hanging
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let status = self.shared.state.lock().status;
        let diagnostic = TaskDiagnostic {
            id: self.shared.id,
            faulted: false,
            canceled: false,
            status,
        };
        debug!(%diagnostic, "background completer dropped");
        self.complete(Err(BackgroundError::NoValue(diagnostic)));
    }
}


/// Client interface, used to monitor a background operation
pub struct BackgroundTask<T> {
    /// Reference-counted shared state
    shared: Arc<SharedState<T>>,
}
//
impl<T: Clone + Send + 'static> BackgroundTask<T> {
    /// Identifier of the operation
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current status of the operation
    pub fn status(&self) -> BackgroundStatus {
        self.shared.state.lock().status
    }

    /// Check if the operation has ended
    pub fn is_finished(&self) -> bool {
        self.status().is_final()
    }

    /// Block until the operation has ended
    ///
    /// Must not be called on the foreground thread.
    ///
    pub fn wait(&self) -> BackgroundOutcome<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.shared.update_cv.wait(&mut state);
        }
    }

    /// Block until the operation has ended, or a timeout has elapsed
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BackgroundOutcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if self.shared.update_cv.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }

    /// Schedule a callback to be run once the operation has ended
    ///
    /// The callback runs on the thread which completes the operation, or
    /// right away on the calling thread if it has already ended.
    ///
    pub fn on_complete<F>(&self, callback: F)
        where F: FnOnce(&BackgroundOutcome<T>) + Send + 'static
    {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }
}
//
impl<T> Clone for BackgroundTask<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}
//
impl<T> fmt::Debug for BackgroundTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BackgroundTask")
         .field("id", &self.shared.id)
         .field("status", &self.shared.state.lock().status)
         .finish()
    }
}


/// State shared between the completer and the tasks
struct SharedState<T> {
    /// Process-unique identifier
    id: u64,

    /// Current operation state (mutex-protected)
    state: Mutex<TaskState<T>>,

    /// Condition variable used to notify waiters about the outcome
    update_cv: Condvar,
}
//
struct TaskState<T> {
    /// Current operation status
    status: BackgroundStatus,

    /// Final outcome, once known
    outcome: Option<BackgroundOutcome<T>>,

    /// Callbacks waiting for the outcome
    callbacks: Vec<Callback<T>>,
}
