//! Bounded retries around a [`Transport`].
//!
//! Exhaustion is reported as a value, not an error, so callers branch
//! explicitly into the dead-letter path.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::Submission;

use super::delivery::{Transport, TransportError};

/// Retry policy for deliveries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff step in milliseconds; the delay after attempt `n` is `n * step`
    #[serde(default = "default_backoff_step")]
    pub backoff_step_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_step() -> u64 {
    1500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(attempt)))
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Final result of a delivery with retries
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Accepted by the transport
    Delivered { attempts: u32 },

    /// Every attempt failed; `error` is the last one
    Exhausted { attempts: u32, error: TransportError },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Wraps a transport with the retry policy
#[derive(Clone)]
pub struct RetryController {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `submission`, sleeping between failed attempts
    pub async fn deliver_with_retry(&self, submission: &Submission) -> DeliveryOutcome {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.transport.deliver(submission).await {
                Ok(()) => {
                    debug!(transport = self.transport.name(), attempt, "Delivery succeeded");
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => {
                    if self.policy.should_retry(attempt) {
                        let delay = self.policy.delay_for_attempt(attempt);

                        warn!(
                            transport = self.transport.name(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Delivery failed, retrying"
                        );

                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return DeliveryOutcome::Exhausted {
                        attempts: attempt,
                        error: e,
                    };
                }
            }
        }
    }
}
