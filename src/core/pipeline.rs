//! Save-and-send pipeline.
//!
//! Every snapshot is persisted to the durable store first, then delivered
//! with retries; on exhaustion it is appended to the dead-letter queue.
//! None of these steps surface errors to the caller: failures are logged
//! and reported in the returned value.

use std::sync::Arc;

use tracing::{error, instrument, warn};

use crate::config::ResolvedConfig;
use crate::domain::Submission;

use super::dead_letter::{DeadLetterQueue, FlushReport};
use super::delivery::{EhrClient, Transport};
use super::retry::{DeliveryOutcome, RetryController};
use super::store::DurableStore;

/// Where a dispatched submission ended up remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the endpoint (or skipped because none is configured)
    Delivered { attempts: u32 },

    /// Retries exhausted; the submission is waiting in the dead-letter queue
    Queued { attempts: u32 },

    /// Retries exhausted and the dead-letter append failed as well
    QueueFailed { attempts: u32 },
}

/// Result of one save-and-send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Whether the durable store write succeeded
    pub persisted: bool,

    pub outcome: DispatchOutcome,
}

/// Store, retry controller and dead-letter queue wired together
pub struct IntakePipeline {
    store: DurableStore,
    retry: RetryController,
    dead_letters: DeadLetterQueue,
}

impl IntakePipeline {
    pub fn new(store: DurableStore, retry: RetryController, dead_letters: DeadLetterQueue) -> Self {
        Self {
            store,
            retry,
            dead_letters,
        }
    }

    /// Build the pipeline from resolved configuration using the HTTP client
    pub fn from_config(config: &ResolvedConfig) -> Self {
        let client = EhrClient::new(
            config.ehr.endpoint.clone(),
            config.ehr.token.clone(),
            config.ehr.format,
            config.ehr.timeout(),
        );
        Self::with_transport(config, Arc::new(client))
    }

    /// Build the pipeline from configuration with a custom transport
    pub fn with_transport(config: &ResolvedConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            DurableStore::new(config.storage_path.clone()),
            RetryController::new(transport, config.retry.clone()),
            DeadLetterQueue::new(config.queue_path.clone()),
        )
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Persist, deliver, and queue on exhaustion
    #[instrument(skip_all, fields(key = %submission.idempotency_key()))]
    pub async fn save_and_send(&self, submission: Submission) -> DispatchReport {
        let persisted = match self.store.persist(&submission).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    path = %self.store.path().display(),
                    error = %e,
                    "Failed to persist submission"
                );
                false
            }
        };

        let outcome = match self.retry.deliver_with_retry(&submission).await {
            DeliveryOutcome::Delivered { attempts } => DispatchOutcome::Delivered { attempts },
            DeliveryOutcome::Exhausted { attempts, error } => {
                warn!(
                    attempts,
                    error = %error,
                    queue = %self.dead_letters.path().display(),
                    "Failed to send intake to EHR, queued for retry"
                );

                match self.dead_letters.enqueue(&submission).await {
                    Ok(()) => DispatchOutcome::Queued { attempts },
                    Err(e) => {
                        error!(
                            queue = %self.dead_letters.path().display(),
                            error = %e,
                            "Failed to queue submission"
                        );
                        DispatchOutcome::QueueFailed { attempts }
                    }
                }
            }
        };

        DispatchReport { persisted, outcome }
    }

    /// One dead-letter flush pass; queue I/O errors are logged and yield `None`
    pub async fn flush(&self) -> Option<FlushReport> {
        match self.dead_letters.flush(&self.retry).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(
                    queue = %self.dead_letters.path().display(),
                    error = %e,
                    "Dead-letter flush failed"
                );
                None
            }
        }
    }
}
