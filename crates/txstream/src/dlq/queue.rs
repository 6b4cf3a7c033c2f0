//! Bounded, retrying writer in front of the dead-letter store.

use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use txstream_core::emit;
use txstream_core::metrics::events::DeadLetterWritten;

use super::store::DeadLetterStore;
use super::types::{DeadLetterEntry, FailureStats};
use crate::error::{DlqClosedSnafu, DlqError};

/// Limits applied to every dead-letter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterSettings {
    /// Per attempt, including the wait for an in-flight slot.
    pub write_timeout: Duration,
    pub max_attempts: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub backoff: Duration,
    pub max_in_flight: usize,
}

/// Writes dead-letter entries without ever blocking a worker indefinitely.
pub struct DeadLetterSink {
    store: Arc<dyn DeadLetterStore>,
    settings: DeadLetterSettings,
    in_flight: Semaphore,
    stats: Mutex<FailureStats>,
}

impl DeadLetterSink {
    pub fn new(store: Arc<dyn DeadLetterStore>, settings: DeadLetterSettings) -> Self {
        Self {
            store,
            in_flight: Semaphore::new(settings.max_in_flight.max(1)),
            settings,
            stats: Mutex::new(FailureStats::default()),
        }
    }

    /// Append `entry`, retrying up to the configured budget.
    ///
    /// An error means the entry was not stored and the record is lost.
    pub async fn enqueue(&self, entry: DeadLetterEntry) -> Result<(), DlqError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(self.settings.write_timeout, self.write(&entry)).await {
                Ok(Ok(())) => {
                    self.stats.lock().await.increment(entry.classification);
                    emit!(DeadLetterWritten {
                        classification: entry.classification.as_str(),
                    });
                    debug!(
                        partition = entry.partition,
                        offset = entry.offset,
                        id = %entry.id,
                        "Dead-letter entry written"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_elapsed) => {
                    last_error = Some(DlqError::DlqTimeout {
                        timeout_ms: self.settings.write_timeout.as_millis() as u64,
                    })
                }
            }

            if attempt < max_attempts {
                if let Some(e) = &last_error {
                    warn!(
                        partition = entry.partition,
                        offset = entry.offset,
                        attempt,
                        error = %e,
                        "Dead-letter write failed, retrying"
                    );
                }
                tokio::time::sleep(self.settings.backoff.saturating_mul(attempt)).await;
            }
        }

        self.stats.lock().await.dropped += 1;
        Err(DlqError::DlqExhausted {
            attempts: max_attempts,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn write(&self, entry: &DeadLetterEntry) -> Result<(), DlqError> {
        let _permit = self.in_flight.acquire().await.context(DlqClosedSnafu)?;
        self.store.append(entry).await
    }

    pub async fn stats(&self) -> FailureStats {
        self.stats.lock().await.clone()
    }

    /// Log the failure summary for this run.
    pub async fn finalize(&self) -> FailureStats {
        let stats = self.stats().await;
        info!(
            written = stats.written(),
            validation = stats.validation,
            serialization = stats.serialization,
            retries_exhausted = stats.retries_exhausted,
            dropped = stats.dropped,
            "Dead-letter sink finalized"
        );
        stats
    }
}
