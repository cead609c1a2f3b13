//! Ticker-driven background tasks with explicit, cooperative shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A periodic job running on the tokio runtime.
///
/// The job first runs one `period` after spawning. Dropping the handle
/// cancels the job at its next suspension point; [`ScheduledTask::shutdown`]
/// additionally waits for it to finish.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn spawn<S, F, Fut>(name: S, period: Duration, mut job: F) -> Self
    where
        S: Into<String>,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(task = %task_name, period_ms = period.as_millis() as u64, "Background task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(task = %task_name, "Background task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        // A tick that races with cancellation still finishes its job
                        job().await;
                    }
                }
            }
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancels the job and waits for it to stop, aborting it if it does not
    /// stop within the grace period
    pub async fn shutdown(mut self) {
        self.token.cancel();

        let Some(mut handle) = self.handle.take() else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => info!(task = %self.name, "Background task stopped"),
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "Background task ended abnormally"),
            Err(_) => {
                warn!(task = %self.name, "Background task ignored cancellation, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_period_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = ScheduledTask::spawn("counter", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = ScheduledTask::spawn("dropped", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(task.name(), "dropped");
        drop(task);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
