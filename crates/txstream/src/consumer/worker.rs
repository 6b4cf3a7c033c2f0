//! Sequential processing of one partition's share of a batch.

use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use txstream_core::emit;
use txstream_core::metrics::events::{
    ActiveWorkers, DeadLetterDropped, RecordProcessed, RecordProcessingDuration, RecordRetried,
    RecordStatus,
};

use super::retry::RetryPolicy;
use crate::dlq::{Classification, DeadLetterEntry, DeadLetterSink};
use crate::error::{FailureClass, ProcessError};
use crate::processor::{Processed, TransactionProcessor};
use crate::record::Record;

/// What a worker reports back to the coordinating task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub partition: i32,
    /// Highest offset such that it and every earlier record in the batch
    /// reached a terminal outcome.
    pub resolved: Option<i64>,
    pub persisted: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub abandoned: u64,
}

impl PartitionOutcome {
    fn new(partition: i32) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    fn record(&mut self, status: RecordStatus, offset: i64) {
        match status {
            RecordStatus::Persisted => self.persisted += 1,
            RecordStatus::Duplicate => self.duplicates += 1,
            RecordStatus::DeadLettered => self.dead_lettered += 1,
            RecordStatus::Dropped => self.dropped += 1,
            RecordStatus::Abandoned => {
                self.abandoned += 1;
                return;
            }
        }
        self.resolved = Some(offset);
    }
}

/// Processes the records of one partition in offset order.
pub struct PartitionWorker {
    pub(super) partition: i32,
    pub(super) topic: String,
    pub(super) records: Vec<Record>,
    pub(super) processor: Arc<TransactionProcessor>,
    pub(super) dead_letters: Arc<DeadLetterSink>,
    pub(super) retry: RetryPolicy,
    pub(super) abandon: CancellationToken,
    pub(super) slots: Option<Arc<Semaphore>>,
    pub(super) active: Arc<AtomicUsize>,
}

impl PartitionWorker {
    pub async fn run(self) -> PartitionOutcome {
        let mut outcome = PartitionOutcome::new(self.partition);

        let _permit = match &self.slots {
            Some(slots) => tokio::select! {
                biased;
                _ = self.abandon.cancelled() => None,
                permit = Arc::clone(slots).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        emit!(ActiveWorkers {
            count,
            topic: self.topic.clone(),
        });

        for (index, record) in self.records.iter().enumerate() {
            let started = Instant::now();
            let status = tokio::select! {
                biased;
                _ = self.abandon.cancelled() => None,
                status = self.resolve(record) => Some(status),
            };

            let Some(status) = status else {
                let remaining = self.records.len() - index;
                warn!(
                    partition = self.partition,
                    offset = record.offset,
                    remaining,
                    "Grace period expired, abandoning unresolved records"
                );
                for _ in 0..remaining {
                    outcome.record(RecordStatus::Abandoned, record.offset);
                    emit!(RecordProcessed {
                        status: RecordStatus::Abandoned,
                        topic: self.topic.clone(),
                    });
                }
                break;
            };

            outcome.record(status, record.offset);
            emit!(RecordProcessed {
                status,
                topic: self.topic.clone(),
            });
            emit!(RecordProcessingDuration {
                duration: started.elapsed(),
                topic: self.topic.clone(),
            });
        }

        let count = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        emit!(ActiveWorkers {
            count,
            topic: self.topic.clone(),
        });

        outcome
    }

    /// Drive one record to a terminal outcome.
    async fn resolve(&self, record: &Record) -> RecordStatus {
        let first_seen = Utc::now();
        let mut backoff = self.retry.backoff();

        loop {
            let error = match self.processor.process(record).await {
                Ok(Processed::Persisted(_)) => return RecordStatus::Persisted,
                Ok(Processed::Duplicate(_)) => return RecordStatus::Duplicate,
                Err(e) => e,
            };

            match error.class() {
                FailureClass::Terminal => {
                    let classification = Classification::terminal(&error);
                    let attempts = backoff.attempts() + 1;
                    return self
                        .dead_letter(record, classification, &error, attempts, first_seen)
                        .await;
                }
                FailureClass::Transient => match backoff.next_delay() {
                    Some(delay) => {
                        emit!(RecordRetried {
                            topic: self.topic.clone(),
                        });
                        warn!(
                            partition = record.partition,
                            offset = record.offset,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Transient failure, retrying record"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let attempts = backoff.attempts();
                        return self
                            .dead_letter(
                                record,
                                Classification::RetriesExhausted,
                                &error,
                                attempts,
                                first_seen,
                            )
                            .await;
                    }
                },
            }
        }
    }

    async fn dead_letter(
        &self,
        record: &Record,
        classification: Classification,
        error: &ProcessError,
        attempts: u32,
        first_seen: chrono::DateTime<Utc>,
    ) -> RecordStatus {
        error!(
            partition = record.partition,
            offset = record.offset,
            classification = classification.as_str(),
            attempts,
            error = %error,
            "Routing record to dead-letter sink"
        );

        let entry = DeadLetterEntry::new(
            record,
            classification,
            error.to_string(),
            attempts,
            first_seen,
        );

        match self.dead_letters.enqueue(entry).await {
            Ok(()) => {
                debug!(partition = record.partition, offset = record.offset, "Record dead-lettered");
                RecordStatus::DeadLettered
            }
            Err(e) => {
                error!(
                    alert = "dead_letter_dropped",
                    partition = record.partition,
                    offset = record.offset,
                    classification = classification.as_str(),
                    error = %e,
                    "Dead-letter write failed, record dropped"
                );
                emit!(DeadLetterDropped {
                    classification: classification.as_str(),
                });
                RecordStatus::Dropped
            }
        }
    }
}
