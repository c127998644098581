// Periodic background task
//
// Tick n is due at start + n * period. A tick that overruns does not cause a
// burst of catch-up ticks: the next due tick is recomputed from the elapsed
// time and the ones in between are skipped.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Index of the next tick to run after tick `last` finished at `elapsed`
///
/// Ticks whose scheduled time already passed are skipped.
pub fn next_tick(last: u64, elapsed: Duration, period: Duration) -> u64 {
    let period = period.max(MIN_PERIOD).as_nanos();
    let elapsed = elapsed.as_nanos();
    let first_not_passed = elapsed.div_ceil(period) as u64;
    first_not_passed.max(last + 1)
}

fn offset(period: Duration, n: u64) -> Duration {
    let nanos = period.as_nanos().saturating_mul(n as u128);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Handle to a spawned periodic task; dropping it stops the task
pub struct PeriodicTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<u64>>>,
}

impl PeriodicTask {
    /// Spawn `tick` on the current tokio runtime, first run immediately
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(name.clone(), period.max(MIN_PERIOD), tick, stop_rx));

        Self {
            name,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Ask the task to stop; wakes it if it is sleeping. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            debug!("Stopping periodic task {}", self.name);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Stop the task and wait for it; returns how many ticks ran
    pub async fn shutdown(&self) -> u64 {
        self.stop();
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<F, Fut>(name: String, period: Duration, mut tick: F, mut stop_rx: watch::Receiver<bool>) -> u64
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!("Periodic task {} started, period {:?}", name, period);

    let start = Instant::now();
    let mut n: u64 = 0;
    let mut ran: u64 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let due = start + offset(period, n);
        tokio::select! {
            _ = sleep_until(due) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        tick().await;
        ran += 1;

        let next = next_tick(n, start.elapsed(), period);
        if next > n + 1 {
            debug!("Periodic task {} skipped {} ticks", name, next - n - 1);
        }
        n = next;
    }

    info!("Periodic task {} stopped after {} ticks", name, ran);
    ran
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_next_tick_on_schedule() {
        let period = Duration::from_secs(1);
        assert_eq!(next_tick(0, Duration::from_millis(10), period), 1);
        assert_eq!(next_tick(3, Duration::from_millis(3500), period), 4);
    }

    #[test]
    fn test_next_tick_skips_missed() {
        let period = Duration::from_secs(1);
        // tick 0 overran until 3.5s: ticks 1..=3 are skipped
        assert_eq!(next_tick(0, Duration::from_millis(3500), period), 4);
        // exactly on a boundary the tick at that instant is still due
        assert_eq!(next_tick(0, Duration::from_secs(2), period), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_period() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("count", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        // ticks at 0s, 1s and 2s
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(task.shutdown().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_tick_does_not_burst() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("slow", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_millis(3500)).await;
                }
            }
        });

        // tick 0 runs until 3.5s, then tick 4 at 4s; 1..=3 never run
        tokio::time::sleep(Duration::from_millis(4200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_sleeping_task_and_is_idempotent() {
        let task = PeriodicTask::spawn("idle", Duration::from_secs(3600), || async {});
        tokio::time::sleep(Duration::from_millis(10)).await;

        task.stop();
        task.stop();
        assert!(task.is_stopped());

        let started = Instant::now();
        assert_eq!(task.shutdown().await, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(task.shutdown().await, 0);
    }
}
