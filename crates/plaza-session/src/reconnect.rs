use std::fmt;
use std::future::Future;
use std::time::Duration;

use platform_core::{BackoffMode, ReconnectSection};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub mode: BackoffMode,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            mode: BackoffMode::Exponential,
            max_retries: 10,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl From<&ReconnectSection> for ReconnectPolicy {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            mode: section.mode,
            max_retries: section.max_retries,
            base_backoff_ms: section.base_backoff_ms,
            max_backoff_ms: section.max_backoff_ms,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = match self.mode {
            BackoffMode::Fixed => self.base_backoff_ms,
            BackoffMode::Exponential => self
                .base_backoff_ms
                .saturating_mul(2_u64.saturating_pow(attempt.min(16))),
        };
        delay.min(self.max_backoff_ms)
    }

    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    /// Runs `op` until it succeeds or `max_retries` attempts have failed,
    /// sleeping the backoff between attempts. On exhaustion returns the number
    /// of failed attempts.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, u32>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        warn!(attempt, error = %err, "reconnect attempts exhausted");
                        return Err(attempt);
                    }
                    let delay = self.backoff(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
