//! Polling-based scheduler monitoring
//!
//! Every tick, the scheduler publishes a snapshot of its activity. Any one
//! thread may monitor it by polling, which is the right tool when a client is
//! only interested in periodically checking the scheduler's status and does not
//! want to synchronize with it, e.g. to refresh a debug overlay.
//!
//! Snapshots go through a triple buffer, so that neither the foreground thread
//! nor the monitor ever wait for each other.

use triple_buffer::{Input, Output, TripleBuffer};


/// Snapshot of the scheduler's activity, taken at the end of a tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Number of ticks driven so far
    pub ticks: u64,

    /// Messages executed during the last tick
    pub drained: usize,

    /// Messages left in the queue for the next tick
    pub backlog: usize,

    /// Work items stepped during the last tick
    pub stepped: usize,

    /// Work items which will be stepped on the next tick
    pub active_work: usize,

    /// Work items waiting for a nested unit of work
    pub suspended_work: usize,
}


/// Foreground side of the statistics channel
pub(crate) struct StatsPublisher {
    /// New snapshots will be sent through this triple buffer
    buf_input: Input<SchedulerStats>,
}
//
impl StatsPublisher {
    /// Publish a new snapshot
    pub(crate) fn publish(&mut self, stats: SchedulerStats) {
        self.buf_input.write(stats);
    }
}


/// Client interface, used to poll the scheduler's activity
pub struct StatsMonitor {
    /// Latest snapshot will be read through this triple buffer
    buf_output: Output<SchedulerStats>,
}
//
impl StatsMonitor {
    /// Access the latest published snapshot
    pub fn stats(&mut self) -> &SchedulerStats {
        self.buf_output.read()
    }
}


/// Set up a statistics channel, starting from empty statistics
pub(crate) fn channel() -> (StatsPublisher, StatsMonitor) {
    let (buf_input, buf_output) =
        TripleBuffer::new(&SchedulerStats::default()).split();
    (StatsPublisher { buf_input }, StatsMonitor { buf_output })
}


/// Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Check the initial state of the channel
    #[test]
    fn initial_state() {
        let (_publisher, mut monitor) = channel();
        assert_eq!(*monitor.stats(), SchedulerStats::default());
    }

    /// Check that snapshots propagate from the publisher to the monitor,
    /// including across threads
    #[test]
    fn propagation() {
        let (mut publisher, mut monitor) = channel();
        publisher.publish(SchedulerStats { ticks: 1, ..Default::default() });
        assert_eq!(monitor.stats().ticks, 1);

        let reader = thread::spawn(move || monitor.stats().clone());
        let last = reader.join().unwrap();
        assert_eq!(last.ticks, 1);
    }
}
