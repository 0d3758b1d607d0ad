//! Scheduler and thread pool configuration
//!
//! | Field | Default |
//! |-------|---------|
//! | `SchedulerConfig::queue_budget` | 88 messages per tick |
//! | `PoolConfig::threads` | available parallelism, or 2 if unknown |
//! | `PoolConfig::thread_name_prefix` | `"async-ops-worker"` |

use std::thread;


/// Default amount of cross-thread messages drained per tick
pub const DEFAULT_QUEUE_BUDGET: usize = 88;


/// Configuration of the foreground scheduler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximal amount of posted messages executed by a single `drive()` call.
    ///
    /// Messages which do not fit in a tick are kept, in order, for the next
    /// one. This bounds the time spent in one tick when producers flood the
    /// queue.
    pub queue_budget: usize,
}
//
impl SchedulerConfig {
    /// Set the per-tick message budget
    pub fn with_queue_budget(mut self, queue_budget: usize) -> Self {
        self.queue_budget = queue_budget;
        self
    }

    /// Normalize configuration values to usable ones
    pub fn normalize(&mut self) {
        if self.queue_budget == 0 {
            self.queue_budget = 1;
        }
    }
}
//
impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { queue_budget: DEFAULT_QUEUE_BUDGET }
    }
}


/// Configuration of the background thread pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker threads
    pub threads: usize,

    /// Worker threads are named `{prefix}-{index}`
    pub thread_name_prefix: String,
}
//
impl PoolConfig {
    /// Set the number of worker threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Normalize configuration values to usable ones
    pub fn normalize(&mut self) {
        if self.threads == 0 {
            self.threads = 1;
        }
    }
}
//
impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(2, |n| n.get()),
            thread_name_prefix: "async-ops-worker".to_string(),
        }
    }
}
