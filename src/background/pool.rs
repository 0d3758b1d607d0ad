//! Thread pool for background work
//!
//! A fixed set of worker threads pull jobs from a shared crossbeam channel.
//! Dropping the pool asks every worker to stop once the jobs queued before
//! the drop are done, then joins them.

use super::{BackgroundError, BackgroundOp, BackgroundTask};
use crate::cancel::CancellationToken;
use crate::completion::capture;
use crate::config::PoolConfig;
use crate::error::PanicError;
use crate::executor::{CallbackExecutor, Job};
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};


/// Message sent to the workers
enum PoolMessage {
    /// Run this job
    Run(Job),

    /// Exit the worker loop
    Shutdown,
}


/// Owner of the worker threads
pub struct ThreadPool {
    /// Handle used to submit jobs
    handle: PoolHandle,

    /// Worker threads, joined on drop
    workers: Vec<JoinHandle<()>>,
}
//
impl ThreadPool {
    /// Spawn the worker threads
    pub fn new(mut config: PoolConfig) -> io::Result<Self> {
        config.normalize();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || worker_loop(receiver))?;
            workers.push(worker);
        }
        debug!(threads = config.threads, "thread pool started");
        Ok(Self {
            handle: PoolHandle { sender },
            workers,
        })
    }

    /// Handle used to submit work to this pool
    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}
//
impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.handle.sender.send(PoolMessage::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("thread pool worker exited abnormally");
            }
        }
        debug!("thread pool stopped");
    }
}


/// Body of a worker thread
fn worker_loop(receiver: Receiver<PoolMessage>) {
    for message in receiver.iter() {
        match message {
            PoolMessage::Run(job) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    let error = PanicError::from_payload(&*payload);
                    error!(%error, "thread pool job panicked");
                }
            }
            PoolMessage::Shutdown => break,
        }
    }
    trace!("thread pool worker exiting");
}


/// Cloneable, thread-safe handle used to submit work to a ThreadPool
#[derive(Clone)]
pub struct PoolHandle {
    sender: Sender<PoolMessage>,
}
//
impl PoolHandle {
    /// Run a closure on the pool, returning a task which tracks its outcome
    ///
    /// Panics fault the task.
    ///
    pub fn spawn<T, F>(&self, f: F) -> BackgroundTask<T>
        where T: Clone + Send + 'static,
              F: FnOnce() -> T + Send + 'static
    {
        self.spawn_with_cancellation(f, &CancellationToken::none())
    }

    /// Run a closure on the pool, unless the token is canceled before a
    /// worker picks it up
    pub fn spawn_with_cancellation<T, F>(&self,
                                         f: F,
                                         token: &CancellationToken)
                                         -> BackgroundTask<T>
        where T: Clone + Send + 'static,
              F: FnOnce() -> T + Send + 'static
    {
        let (mut completer, task) = BackgroundOp::new().split();
        let token = token.clone();
        self.execute(Box::new(move || {
            if token.is_canceled() {
                completer.complete(Err(BackgroundError::Canceled));
                return;
            }
            completer.mark_running();
            completer.complete(capture(f).map_err(BackgroundError::Faulted));
        }));
        task
    }
}
//
impl CallbackExecutor for PoolHandle {
    /// Queue a job for the workers. Jobs submitted after the pool was dropped
    /// are discarded.
    fn execute(&self, job: Job) {
        if self.sender.send(PoolMessage::Run(job)).is_err() {
            warn!("thread pool stopped, discarding job");
        }
    }
}
