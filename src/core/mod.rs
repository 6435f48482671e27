//! Core submission durability and delivery logic.
//!
//! This module contains:
//! - DurableStore: Local JSON list of every submission
//! - Transform: Submission → wire payload (fhir / raw)
//! - Delivery: Single HTTP delivery attempt
//! - Retry: Bounded retries with linear backoff
//! - DeadLetterQueue: JSONL queue of undelivered submissions
//! - IntakePipeline: save → send → queue composition

pub mod dead_letter;
pub mod delivery;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod transform;

// Re-export commonly used types
pub use dead_letter::{DeadLetterQueue, FlushReport, PendingRecord, QueueError, QueueReplayError};
pub use delivery::{EhrClient, Transport, TransportError};
pub use pipeline::{DispatchOutcome, DispatchReport, IntakePipeline};
pub use retry::{DeliveryOutcome, RetryController, RetryPolicy};
pub use store::{DurableStore, PersistReport, StoreError};
pub use transform::{transform, Payload, PayloadFormat};
