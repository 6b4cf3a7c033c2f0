//! Internal events for metrics emission.
//!
//! Each struct is one measurable occurrence in the consumer pipeline. Pipeline
//! events carry a `topic` label so several consumers can share one endpoint.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Consumer loop events
// ============================================================================

/// Records pulled from the log in one poll.
pub struct RecordsPolled {
    pub count: u64,
    pub topic: String,
}

impl InternalEvent for RecordsPolled {
    fn emit(self) {
        trace!(count = self.count, topic = %self.topic, "Records polled");
        counter!("txstream_records_polled_total", "topic" => self.topic).increment(self.count);
    }
}

/// Terminal outcome of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Persisted,
    Duplicate,
    DeadLettered,
    Dropped,
    Abandoned,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Persisted => "persisted",
            RecordStatus::Duplicate => "duplicate",
            RecordStatus::DeadLettered => "dead_lettered",
            RecordStatus::Dropped => "dropped",
            RecordStatus::Abandoned => "abandoned",
        }
    }
}

pub struct RecordProcessed {
    pub status: RecordStatus,
    pub topic: String,
}

impl InternalEvent for RecordProcessed {
    fn emit(self) {
        trace!(status = self.status.as_str(), topic = %self.topic, "Record processed");
        counter!(
            "txstream_records_processed_total",
            "status" => self.status.as_str(),
            "topic" => self.topic
        )
        .increment(1);
    }
}

/// A transient failure is being retried in place.
pub struct RecordRetried {
    pub topic: String,
}

impl InternalEvent for RecordRetried {
    fn emit(self) {
        trace!(topic = %self.topic, "Record retried");
        counter!("txstream_records_retried_total", "topic" => self.topic).increment(1);
    }
}

/// Wall time spent resolving one record, retries included.
pub struct RecordProcessingDuration {
    pub duration: Duration,
    pub topic: String,
}

impl InternalEvent for RecordProcessingDuration {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis(), topic = %self.topic, "Record processing duration");
        histogram!("txstream_record_processing_duration_seconds", "topic" => self.topic)
            .record(self.duration.as_secs_f64());
    }
}

pub struct BatchCompleted {
    pub records: u64,
    pub duration: Duration,
    pub topic: String,
}

impl InternalEvent for BatchCompleted {
    fn emit(self) {
        trace!(
            records = self.records,
            duration_ms = self.duration.as_millis(),
            topic = %self.topic,
            "Batch completed"
        );
        counter!("txstream_batches_total", "topic" => self.topic.clone()).increment(1);
        histogram!("txstream_batch_duration_seconds", "topic" => self.topic)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Dead-letter events
// ============================================================================

pub struct DeadLetterWritten {
    pub classification: &'static str,
}

impl InternalEvent for DeadLetterWritten {
    fn emit(self) {
        trace!(classification = self.classification, "Dead letter written");
        counter!("txstream_dead_letters_total", "classification" => self.classification)
            .increment(1);
    }
}

/// A record was lost because the dead-letter store rejected every attempt.
pub struct DeadLetterDropped {
    pub classification: &'static str,
}

impl InternalEvent for DeadLetterDropped {
    fn emit(self) {
        trace!(classification = self.classification, "Dead letter dropped");
        counter!("txstream_dead_letters_dropped_total", "classification" => self.classification)
            .increment(1);
    }
}

// ============================================================================
// Log source events
// ============================================================================

pub struct OffsetsCommitted {
    pub partitions: u64,
    pub topic: String,
}

impl InternalEvent for OffsetsCommitted {
    fn emit(self) {
        trace!(partitions = self.partitions, topic = %self.topic, "Offsets committed");
        counter!("txstream_commits_total", "topic" => self.topic.clone()).increment(1);
        counter!("txstream_committed_partitions_total", "topic" => self.topic)
            .increment(self.partitions);
    }
}

pub struct CommitFailed {
    pub topic: String,
}

impl InternalEvent for CommitFailed {
    fn emit(self) {
        trace!(topic = %self.topic, "Commit failed");
        counter!("txstream_commit_failures_total", "topic" => self.topic).increment(1);
    }
}

pub struct PollFailed {
    pub topic: String,
}

impl InternalEvent for PollFailed {
    fn emit(self) {
        trace!(topic = %self.topic, "Poll failed");
        counter!("txstream_poll_failures_total", "topic" => self.topic).increment(1);
    }
}

/// Number of partition workers currently running.
pub struct ActiveWorkers {
    pub count: usize,
    pub topic: String,
}

impl InternalEvent for ActiveWorkers {
    fn emit(self) {
        trace!(count = self.count, topic = %self.topic, "Active workers");
        gauge!("txstream_active_workers", "topic" => self.topic).set(self.count as f64);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "txstream_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "txstream_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
