//! Error types for the tx-stream consumer.
//!
//! Per-record errors (`ProcessError`, `StoreError`, `DlqError`) are absorbed by
//! the consumer loop. Only `ConsumerError` and `AppError` reach the process
//! boundary.

use snafu::prelude::*;

pub use txstream_core::error::{ConfigError, MetricsError, StorageError};

/// Whether a failed operation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Deterministic; retrying cannot help.
    Terminal,
    /// Infrastructure trouble that may clear on its own.
    Transient,
}

/// Errors from the partitioned log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    #[snafu(display("Kafka error: {source}"))]
    Kafka {
        source: rdkafka::error::KafkaError,
    },

    #[snafu(display("Topic '{topic}' not found on the brokers"))]
    TopicNotFound { topic: String },

    #[snafu(display("Blocking Kafka call failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// The log cannot be reached right now.
    #[snafu(display("Log source unavailable: {message}"))]
    SourceUnavailable { message: String },
}

/// Errors from the document store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// A document with this business identifier already exists.
    #[snafu(display("Transaction '{transaction_id}' already persisted"))]
    DuplicateKey { transaction_id: String },

    #[snafu(display("Failed to serialize transaction: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Store write failed: {source}"))]
    StoreWrite { source: StorageError },

    #[snafu(display("Store unavailable: {message}"))]
    StoreUnavailable { message: String },
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }

    pub fn class(&self) -> FailureClass {
        match self {
            StoreError::DuplicateKey { .. } | StoreError::Serialize { .. } => {
                FailureClass::Terminal
            }
            StoreError::StoreWrite { .. } | StoreError::StoreUnavailable { .. } => {
                FailureClass::Transient
            }
        }
    }
}

/// Errors returned by the transaction processor for a single record.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProcessError {
    /// The payload is malformed or breaks a business rule.
    #[snafu(display("Validation failed: {message}"))]
    Validation { message: String },

    #[snafu(display("Persistence failed: {source}"))]
    Persistence { source: StoreError },
}

impl ProcessError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProcessError::Validation { .. } => FailureClass::Terminal,
            ProcessError::Persistence { source } => source.class(),
        }
    }
}

/// Errors from the dead-letter path.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DlqError {
    #[snafu(display("Failed to serialize dead-letter entry: {source}"))]
    DlqSerialize { source: serde_json::Error },

    #[snafu(display("Failed to write dead-letter entry: {source}"))]
    DlqWrite { source: StorageError },

    #[snafu(display("Failed to read dead-letter entry {path}: {source}"))]
    DlqRead { path: String, source: StorageError },

    #[snafu(display("Corrupt dead-letter entry {path}: {source}"))]
    DlqDecode {
        path: String,
        source: serde_json::Error,
    },

    #[snafu(display("Dead-letter write timed out after {timeout_ms}ms"))]
    DlqTimeout { timeout_ms: u64 },

    #[snafu(display("Dead-letter store unavailable: {message}"))]
    DlqUnavailable { message: String },

    #[snafu(display("Dead-letter sink closed"))]
    DlqClosed {
        source: tokio::sync::AcquireError,
    },

    /// Every attempt failed; the entry is lost.
    #[snafu(display("Dead-letter write gave up after {attempts} attempts: {message}"))]
    DlqExhausted { attempts: u32, message: String },
}

/// Errors that stop the consumer loop.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConsumerError {
    #[snafu(display("Log connection lost after {attempts} attempts: {source}"))]
    Connection { attempts: u32, source: SourceError },

    #[snafu(display("Worker for partition {partition} panicked: {source}"))]
    WorkerPanicked {
        partition: i32,
        source: tokio::task::JoinError,
    },
}

/// Top-level application errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("Storage setup failed: {source}"))]
    Storage { source: StorageError },

    #[snafu(display("Failed to connect to the log: {source}"))]
    Connect { source: SourceError },

    #[snafu(display("Consumer failed: {source}"))]
    Consumer { source: ConsumerError },
}

impl From<ConfigError> for AppError {
    fn from(source: ConfigError) -> Self {
        AppError::Config { source }
    }
}

impl From<ConsumerError> for AppError {
    fn from(source: ConsumerError) -> Self {
        AppError::Consumer { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classes() {
        let duplicate = StoreError::DuplicateKey {
            transaction_id: "tx-1".into(),
        };
        assert!(duplicate.is_duplicate());

        let unavailable = StoreError::StoreUnavailable {
            message: "connection refused".into(),
        };
        assert_eq!(unavailable.class(), FailureClass::Transient);
        assert!(!unavailable.is_duplicate());

        let write = StoreError::StoreWrite {
            source: StorageError::InvalidUrl {
                url: "s3://".into(),
            },
        };
        assert_eq!(write.class(), FailureClass::Transient);
    }

    #[test]
    fn test_process_error_classes() {
        let validation = ProcessError::Validation {
            message: "amount must be positive".into(),
        };
        assert_eq!(validation.class(), FailureClass::Terminal);

        let transient = ProcessError::Persistence {
            source: StoreError::StoreUnavailable {
                message: "timeout".into(),
            },
        };
        assert_eq!(transient.class(), FailureClass::Transient);
    }
}
