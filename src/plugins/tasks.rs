//! Background task supervision for plugins.
//!
//! Every long-running piece of plugin work goes through a [`TaskGroup`] so
//! shutdown can cancel and then wait for all of it with a bound on how long
//! stragglers may hold the process.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::util::now_ts;

#[derive(Clone)]
pub struct TaskGroup {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by spawned work; fires once shutdown begins.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a future until completion or shutdown, logging failure.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "task cancelled");
                }
                result = future => {
                    match result {
                        Ok(()) => debug!(task = name, "task finished"),
                        Err(e) => error!(task = name, error = %e, "task failed"),
                    }
                }
            }
        });
    }

    /// Run `tick` every `period` until shutdown. A failing tick is logged
    /// and the schedule keeps going.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task = name, "periodic task cancelled");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = tick().await {
                            error!(task = name, error = %e, "periodic task tick failed");
                        }
                    }
                }
            }
        });
    }

    /// Run a future at an absolute unix time. A due time in the past fires
    /// immediately.
    pub fn spawn_at<F>(&self, name: &'static str, due: i64, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let delay = Duration::from_secs((due - now_ts()).max(0) as u64);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task = name, "timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = future.await {
                        error!(task = name, error = %e, "timer task failed");
                    }
                }
            }
        });
    }

    /// Cancel everything and wait up to `timeout` for tasks to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tracker.len(),
                "background tasks did not drain in time"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn overdue_timer_fires_immediately() {
        let group = TaskGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        group.spawn_at("overdue", now_ts() - 60, async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let group = TaskGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        group.spawn_at("future", now_ts() + 3600, async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        group.shutdown(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_keeps_ticking_after_errors() {
        let group = TaskGroup::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        group.spawn_periodic("flaky", Duration::from_secs(5), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("first tick fails")
                }
                Ok(())
            }
        });
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        group.shutdown(Duration::from_secs(1)).await;
    }
}
