//! Continuation executors
//!
//! Whenever a future reaches its terminal state, one important design issue is
//! to decide where its continuations should be executed.
//!
//! The rule followed by this crate is that continuations always run on the
//! foreground thread. If the future was completed on the foreground thread
//! itself, this is achieved by running the continuations inline, as part of
//! the completion, without any extra scheduling hop. If the future was
//! completed on any other thread, the continuations are instead packaged into
//! a message which is posted to the scheduler, and will run during the next
//! call to `Scheduler::drive()`.
//!
//! These two strategies are modeled as implementations of the CallbackExecutor
//! trait, and the scheduler picks the right one for the calling thread.

pub mod inline;

pub use self::inline::InlineExecutor;


/// Type-erased unit of work which can be sent across threads
pub type Job = Box<dyn FnOnce() + Send + 'static>;


/// Entry point to continuation scheduling. Executes jobs somewhere, either
/// right away or at a later time.
pub trait CallbackExecutor {
    /// Schedule a job for execution
    fn execute(&self, job: Job);
}
