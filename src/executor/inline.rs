//! Inline callback executor, implementing synchronous callback execution
//!
//! This executor runs jobs directly on the calling thread, as part of the call
//! to `execute()`. It is only correct to use it when the calling thread is the
//! foreground thread, which is what the scheduler checks before handing it out.

use crate::executor::{CallbackExecutor, Job};


/// CallbackExecutor implementation suitable for inline callback execution
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;
//
impl CallbackExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}
