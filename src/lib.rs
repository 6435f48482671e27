//! intake-relay - durable capture and delivery of intake submissions
//!
//! Structured intake data gathered during a live voice session is
//! snapshotted, persisted locally, and forwarded to a remote clinical
//! records endpoint with at-least-once delivery.
//!
//! # Architecture
//!
//! The system is built around a save-then-send pipeline:
//! - Every snapshot is appended to a local JSON store before any network call
//! - Delivery is retried a bounded number of times with linear backoff
//! - Exhausted submissions go to a JSONL dead-letter queue that is replayed
//!   at session start, periodically, and at teardown
//!
//! # Modules
//!
//! - `domain`: Data structures (Submission, IntakeEvent)
//! - `core`: Store, payload transform, delivery, retry, dead-letter queue
//! - `session`: Session aggregator and flush schedule
//! - `config`: Layered configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a session fed from stdin
//! echo '{"type":"intake.update","fields":{"name":"Jane Doe"}}' | intake-relay session
//!
//! # Retry queued submissions
//! intake-relay flush
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod session;

// Re-export main types at crate root for convenience
pub use config::ResolvedConfig;
pub use core::{DeadLetterQueue, DurableStore, IntakePipeline, PayloadFormat, RetryController};
pub use domain::{DataPacket, FieldMap, IntakeEvent, Participant, Submission};
pub use session::{SessionAggregator, SessionSummary};
