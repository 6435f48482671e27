//! Domain types for intake capture.
//!
//! This module contains the core data structures:
//! - Submission: Immutable snapshot of captured intake fields
//! - Events: Incoming session packets and how they mutate the fields

pub mod events;
pub mod submission;

// Re-export commonly used types
pub use events::{DataPacket, IntakeEvent, IntakeEventKind, MalformedEvent};
pub use submission::{now_epoch_seconds, FieldMap, Participant, Submission};
