//! Cross-thread message queue of the foreground scheduler
//!
//! Any thread may post messages, which the foreground thread later executes
//! in FIFO order during `Scheduler::drive()`. A message may carry a signal,
//! which lets a blocked sender know what became of its message.

use crate::error::{PanicError, SendError, UsageError};
use crate::executor::Job;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;


/// Queued callback
pub(crate) struct Message {
    /// Action to be run on the foreground thread
    action: Option<Job>,

    /// Notified once the action has run, or will never run
    signal: Option<Arc<SendSignal>>,
}
//
impl Message {
    /// Message whose poster does not wait for it
    pub(crate) fn post(action: Job) -> Self {
        Self { action: Some(action), signal: None }
    }

    /// Message whose sender blocks until it has been executed
    pub(crate) fn send(action: Job, signal: Arc<SendSignal>) -> Self {
        Self { action: Some(action), signal: Some(signal) }
    }

    /// Split the message into its action and its signal
    pub(crate) fn into_parts(mut self) -> (Option<Job>, Option<Arc<SendSignal>>) {
        (self.action.take(), self.signal.take())
    }
}
//
impl Drop for Message {
    /// If a message is dropped before it was executed, release its sender in
    /// order to prevent it from hanging
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.finish(SignalState::Dropped);
        }
    }
}


/// What became of a sent message
pub(crate) enum SignalState {
    /// Not executed yet
    Waiting,

    /// The action ran to completion
    Executed,

    /// The action panicked
    Panicked(PanicError),

    /// The message was discarded without running
    Dropped,
}


/// Blocking notification of a sender, see Message::send()
pub(crate) struct SendSignal {
    /// Current state of the sent message
    state: Mutex<SignalState>,

    /// Condition variable used to wake the sender up
    update_cv: Condvar,
}
//
impl SendSignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::Waiting),
            update_cv: Condvar::new(),
        }
    }

    /// Record the fate of the message, only the first call has an effect
    pub(crate) fn finish(&self, outcome: SignalState) {
        let mut state = self.state.lock();
        if matches!(*state, SignalState::Waiting) {
            *state = outcome;
            self.update_cv.notify_all();
        }
    }

    /// Block until the fate of the message is known
    pub(crate) fn wait(&self) -> Result<(), SendError> {
        let mut state = self.state.lock();
        while matches!(*state, SignalState::Waiting) {
            self.update_cv.wait(&mut state);
        }
        match std::mem::replace(&mut *state, SignalState::Dropped) {
            SignalState::Executed => Ok(()),
            SignalState::Panicked(error) => Err(SendError::Panicked(error)),
            SignalState::Dropped | SignalState::Waiting => {
                Err(UsageError::SchedulerClosed.into())
            }
        }
    }
}


/// FIFO queue of posted messages, protected by a mutex
pub(crate) struct EventLoopQueue {
    inner: Mutex<QueueState>,
}
//
struct QueueState {
    /// Messages which were not executed yet
    messages: VecDeque<Message>,

    /// Once closed, the queue refuses new messages
    closed: bool,
}
//
impl EventLoopQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Enqueue a message, handing it back if the queue is closed
    pub(crate) fn push(&self, message: Message) -> Result<(), Message> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(message);
        }
        inner.messages.push_back(message);
        Ok(())
    }

    /// Dequeue the oldest message
    pub(crate) fn pop(&self) -> Option<Message> {
        self.inner.lock().messages.pop_front()
    }

    /// Number of messages waiting
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Refuse further messages and hand back the pending ones
    pub(crate) fn close(&self) -> VecDeque<Message> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        std::mem::take(&mut inner.messages)
    }

    /// Check if the queue was closed
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
