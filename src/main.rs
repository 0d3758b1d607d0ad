//! Small foreground host, showing how an application would drive the crate
//!
//! The main thread plays the role of a frame loop: it starts a few units of
//! work, then drives the scheduler once per simulated frame until all of them
//! are done. Set RUST_LOG=foreground_async_ops=trace to watch what happens.

use foreground_async_ops::coroutine::from_fn;
use foreground_async_ops::{PoolConfig, Scheduler, Step, TaskFactory, ThreadPool};
use std::error::Error;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Duration of one simulated frame
const FRAME: Duration = Duration::from_millis(16);


fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    let scheduler = Scheduler::new();
    let pool = ThreadPool::new(PoolConfig::default())?;
    let factory = TaskFactory::new(scheduler.handle());
    let mut monitor = scheduler.handle().take_stats_monitor();

    // Work done on the foreground thread, on a pool, and over several ticks
    let answer = factory.start_new(|| 6 * 7);
    let crunched = factory.start_background(pool.handle(), || (1..=20u64).product::<u64>() % 1000);
    let mut countdown = 3u64;
    let counted = factory.start_coroutine(from_fn(move || {
        if countdown == 0 {
            Step::Complete(3)
        } else {
            countdown -= 1;
            Step::Yield
        }
    }));
    let delayed = factory.delay(Duration::from_millis(50)).continue_with(|_| 50u64);

    let all = factory.when_all(vec![answer, crunched, counted, delayed]);
    let report = all.continue_with(|joined| match joined.result() {
        Ok(values) => info!(?values, "all work done"),
        Err(error) => info!(%error, "work did not complete"),
    });

    let mut frames = 0u64;
    while !report.is_completed() {
        scheduler.drive()?;
        frames += 1;
        thread::sleep(FRAME);
    }
    if let Some(monitor) = monitor.as_mut() {
        info!(frames, stats = ?monitor.stats(), "frame loop finished");
    }
    Ok(())
}
