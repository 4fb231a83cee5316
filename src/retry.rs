use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};

use crate::LLMError;

/// Exponential backoff: `base * 2^(retry - 1)`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, the retry
/// budget is spent, or `proceed` says stop. `proceed` is consulted after each
/// backoff sleep, before the next attempt is issued.
pub async fn retry_call<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    proceed: P,
) -> Result<T, LLMError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
    P: Fn() -> bool,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.allows(retry + 1) => {
                retry += 1;
                let delay = policy.backoff(retry);
                tracing::warn!(
                    call = label,
                    attempt = retry + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "model call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                if !proceed() {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}
