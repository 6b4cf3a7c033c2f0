//! Dead-letter side channel for records that failed terminally.
//!
//! Entries are written as individual JSON objects so operators can list and
//! replay them out of band.

mod queue;
mod store;
mod types;

pub use queue::{DeadLetterSettings, DeadLetterSink};
pub use store::{DeadLetterStore, ObjectDeadLetterStore};
pub use types::{Classification, DeadLetterEntry, FailureStats};
