//! Interval scheduler
//!
//! Runs one orchestrator cycle, sleeps for the configured interval and repeats until
//! cancelled. Cycle failures are logged and do not stop the loop. Cancellation is seen
//! between cycles and during the sleep; a cycle in progress always runs to completion.

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::PipelineOrchestrator;

pub struct PipelineScheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
}

impl PipelineScheduler {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            cancel,
        }
    }

    /// Run the loop on a background task
    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    /// Run until cancelled, returning the number of completed cycles
    pub async fn run(self) -> u64 {
        info!(interval_secs = self.interval.as_secs(), "Scheduler started");
        let mut cycles = 0u64;

        while !self.cancel.is_cancelled() {
            info!("Starting pipelines run at {}", Local::now().format("%Y-%m-%d %H:%M:%S"));

            match self.orchestrator.run_cycle().await {
                Ok(report) => info!(layers = report.layers.len(), "Pipelines run finished"),
                Err(e) => error!("Pipelines run failed: {}", e),
            }
            cycles += 1;

            info!("Sleeping for {} seconds...", self.interval.as_secs());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {},
            }
        }

        info!(cycles, "Scheduler stopped");
        cycles
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::execution_log::MemoryExecutionLog;
    use crate::retry::RetryPolicy;

    fn idle_orchestrator() -> Arc<PipelineOrchestrator> {
        Arc::new(PipelineOrchestrator::new(
            Vec::new(),
            Arc::new(MemoryExecutionLog::new()),
            RetryPolicy::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_stops_loop() {
        let cancel = CancellationToken::new();
        let handle =
            PipelineScheduler::new(idle_orchestrator(), Duration::from_secs(180), cancel.clone()).spawn();

        tokio::time::sleep(Duration::from_secs(200)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let cycles = PipelineScheduler::new(idle_orchestrator(), Duration::from_secs(1), cancel)
            .run()
            .await;
        assert_eq!(cycles, 0);
    }
}
