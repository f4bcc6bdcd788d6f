//! Fixed-delay retry for layer runs

use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::error::{EtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted
    ///
    /// On exhaustion the last error is wrapped in [`EtlError::Orchestration`].
    pub async fn run<T, F, Fut>(&self, step: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} - Attempt {}/{} failed: {}", step, attempt, self.attempts, e);

                    if attempt >= self.attempts {
                        error!("{} - All {} attempts failed: {}", step, self.attempts, e);
                        return Err(EtlError::Orchestration {
                            step: step.to_string(),
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    info!("{} - Retrying in {} seconds...", step, self.delay.as_secs());
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config.attempts, config.delay())
    }
}
