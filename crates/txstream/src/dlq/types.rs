//! Dead-letter entry and failure bookkeeping.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProcessError, StoreError};
use crate::record::Record;

/// Why a record ended up in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Validation,
    Serialization,
    RetriesExhausted,
}

impl Classification {
    /// Classify an error that was not retried further.
    pub fn terminal(error: &ProcessError) -> Self {
        match error {
            ProcessError::Validation { .. } => Classification::Validation,
            ProcessError::Persistence {
                source: StoreError::Serialize { .. },
            } => Classification::Serialization,
            // Only transient persistence failures reach here, after retries ran out
            ProcessError::Persistence { .. } => Classification::RetriesExhausted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Validation => "validation",
            Classification::Serialization => "serialization",
            Classification::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// A terminally failed record plus failure metadata. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Base64 of the message key.
    pub key: Option<String>,
    /// Base64 of the raw payload.
    pub payload: String,
    pub error: String,
    pub classification: Classification,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        record: &Record,
        classification: Classification,
        error: String,
        attempts: u32,
        first_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.as_ref().map(|k| STANDARD.encode(k)),
            payload: STANDARD.encode(&record.payload),
            error,
            classification,
            attempts,
            first_seen,
            last_attempt: Utc::now(),
        }
    }

    /// Original payload bytes, for replay.
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.payload)
    }
}

/// Dead-letter counts by classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub validation: usize,
    pub serialization: usize,
    pub retries_exhausted: usize,
    /// Entries lost because the store rejected every attempt.
    pub dropped: usize,
}

impl FailureStats {
    pub fn increment(&mut self, classification: Classification) {
        match classification {
            Classification::Validation => self.validation += 1,
            Classification::Serialization => self.serialization += 1,
            Classification::RetriesExhausted => self.retries_exhausted += 1,
        }
    }

    /// Entries successfully written.
    pub fn written(&self) -> usize {
        self.validation + self.serialization + self.retries_exhausted
    }
}
