//! Periodic background tasks

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A named routine running on a fixed interval until stopped
///
/// The first run happens one full interval after spawning. A tick that
/// overruns the interval delays the next one instead of bursting.
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn `tick` on the current Tokio runtime
    pub fn spawn<T, Fut>(name: &'static str, period: Duration, mut tick: T) -> Self
    where
        T: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                tick().await;
            }
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "scheduled task started");
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the task at its next suspension point
    pub fn stop(&self) {
        self.handle.abort();
        tracing::debug!(task = self.name, "scheduled task stopped");
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
