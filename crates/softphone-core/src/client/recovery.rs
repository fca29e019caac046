//! Reconnection backoff and operation timeouts

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{SoftphoneError, SoftphoneResult};

/// Configuration for reconnection after unexpected transport loss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Maximum number of connect+register attempts per outage
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add ±10% jitter to delays
    pub use_jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Unjittered delay before attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Attempt counter for one outage, advanced by the reconnect driver only
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;

        if self.policy.use_jitter {
            let jitter = (rand::random::<f64>() - 0.5) * 0.2;
            let millis = delay.as_millis() as f64;
            return Some(Duration::from_millis((millis * (1.0 + jitter)) as u64));
        }
        Some(delay)
    }

    /// Attempts handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Start counting again for the next outage
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Helper to add operation timeout with proper error context
///
/// ```rust
/// # use std::time::Duration;
/// # use softphone_core::client::with_timeout;
/// # use softphone_core::SoftphoneResult;
/// # tokio_test::block_on(async {
/// let result: SoftphoneResult<u32> = with_timeout("lookup", Duration::from_secs(1), async { Ok(7) }).await;
/// assert_eq!(result, Ok(7));
/// # });
/// ```
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> SoftphoneResult<T>
where
    F: Future<Output = SoftphoneResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                operation = operation_name,
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(SoftphoneError::OperationTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}
