//! Recurring background work with a cancel handle.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A task that runs `tick` every `period` until cancelled. Dropping the
/// handle cancels it too.
#[derive(Debug)]
pub struct RecurringTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl RecurringTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        tracing::debug!(task = name, ?period, "recurring task started");
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(self) {}

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RecurringTask {
    fn drop(&mut self) {
        self.handle.abort();
        tracing::debug!(task = self.name, "recurring task cancelled");
    }
}
