//! The consumer loop: poll a batch, fan it out to partition workers, commit.
//!
//! One coordinating task owns the log source and the consumption position.
//! Each partition of a batch is processed by its own tokio task, strictly in
//! offset order. A partition's position only moves once its worker reports
//! the records as resolved, and the log is told about it only after the whole
//! batch has settled.
//!
//! Shutdown is two-staged. The caller's token stops further polling, and the
//! batch in flight drains. If it has not drained when the grace period runs
//! out, an internal abandon token stops the workers and whatever they had not
//! resolved stays uncommitted for redelivery.

mod position;
mod retry;
mod worker;

pub use position::{ConsumptionPosition, PartitionCursor};
pub use retry::{Backoff, RetryPolicy, connect_with_retry, random_jitter};
pub use worker::PartitionOutcome;

use snafu::prelude::*;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use txstream_core::emit;
use txstream_core::metrics::events::{BatchCompleted, CommitFailed, OffsetsCommitted, PollFailed, RecordsPolled};

use crate::dlq::DeadLetterSink;
use crate::error::{ConnectionSnafu, ConsumerError};
use crate::processor::TransactionProcessor;
use crate::record::Batch;
use crate::source::LogSource;
use worker::PartitionWorker;

/// Longest shutdown grace period accepted.
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Runtime settings for the consumer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub topic: String,
    pub records_per_poll: usize,
    /// Per-record budget for transient processing failures.
    pub retry: RetryPolicy,
    /// Budget for consecutive poll or commit failures.
    pub reconnect: RetryPolicy,
    /// How long in-flight records may keep running after shutdown. Capped at
    /// [`MAX_GRACE_PERIOD`].
    pub grace_period: Duration,
    pub max_workers: Option<usize>,
}

/// Running totals for one consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub batches: u64,
    pub polled: u64,
    pub persisted: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub commits: u64,
}

impl ConsumerStats {
    fn absorb(&mut self, outcome: &PartitionOutcome) {
        self.persisted += outcome.persisted;
        self.duplicates += outcome.duplicates;
        self.dead_lettered += outcome.dead_lettered;
        self.dropped += outcome.dropped;
        self.abandoned += outcome.abandoned;
    }
}

pub struct TxConsumer<S: LogSource> {
    source: S,
    processor: Arc<TransactionProcessor>,
    dead_letters: Arc<DeadLetterSink>,
    settings: ConsumerSettings,
    position: ConsumptionPosition,
    stats: ConsumerStats,
    worker_slots: Option<Arc<Semaphore>>,
    active_workers: Arc<AtomicUsize>,
}

impl<S: LogSource> TxConsumer<S> {
    pub fn new(
        source: S,
        processor: Arc<TransactionProcessor>,
        dead_letters: Arc<DeadLetterSink>,
        settings: ConsumerSettings,
    ) -> Self {
        let worker_slots = settings
            .max_workers
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        Self {
            source,
            processor,
            dead_letters,
            settings,
            position: ConsumptionPosition::default(),
            stats: ConsumerStats::default(),
            worker_slots,
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Consume until `shutdown` is cancelled or the log stays unreachable
    /// past the reconnect budget.
    ///
    /// With `auto_commit` off the position still advances internally but is
    /// never sent to the log.
    pub async fn poll(
        &mut self,
        shutdown: CancellationToken,
        auto_commit: bool,
    ) -> Result<(), ConsumerError> {
        let abandon = CancellationToken::new();
        let grace_deadline = Arc::new(OnceLock::new());
        let watcher = tokio::spawn(watch_grace_period(
            shutdown.clone(),
            abandon.clone(),
            self.settings.grace_period,
            Arc::clone(&grace_deadline),
        ));

        info!(
            topic = %self.settings.topic,
            records_per_poll = self.settings.records_per_poll,
            auto_commit,
            "Consumer started"
        );

        let result = self
            .run(&shutdown, &abandon, &grace_deadline, auto_commit)
            .await;
        watcher.abort();

        result
    }

    async fn run(
        &mut self,
        shutdown: &CancellationToken,
        abandon: &CancellationToken,
        grace_deadline: &OnceLock<Instant>,
        auto_commit: bool,
    ) -> Result<(), ConsumerError> {
        let mut reconnect = self.settings.reconnect.backoff();

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, no further polls");
                return Ok(());
            }

            let polled = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during poll");
                    return Ok(());
                }

                result = self.source.poll(self.settings.records_per_poll) => result,
            };

            let batch = match polled {
                Ok(batch) => {
                    reconnect.reset();
                    batch
                }
                Err(e) => {
                    emit!(PollFailed {
                        topic: self.settings.topic.clone(),
                    });
                    match reconnect.next_delay() {
                        Some(delay) => {
                            warn!(
                                attempt = reconnect.attempts(),
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Poll failed, retrying"
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }
                        None => {
                            error!(attempts = reconnect.attempts(), error = %e, "Log unreachable, giving up");
                            return Err(e).context(ConnectionSnafu {
                                attempts: reconnect.attempts(),
                            });
                        }
                    }
                }
            };

            if batch.is_empty() {
                continue;
            }

            self.process_batch(batch, abandon).await?;

            if auto_commit {
                self.commit(shutdown, grace_deadline).await?;
            }
        }
    }

    async fn process_batch(
        &mut self,
        batch: Batch,
        abandon: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let started = std::time::Instant::now();
        let count = batch.len() as u64;
        let topic = self.settings.topic.clone();

        emit!(RecordsPolled {
            count,
            topic: topic.clone(),
        });
        self.stats.batches += 1;
        self.stats.polled += count;

        let mut handles = Vec::new();
        for (partition, records) in batch.into_partitions() {
            let worker = PartitionWorker {
                partition,
                topic: topic.clone(),
                records,
                processor: Arc::clone(&self.processor),
                dead_letters: Arc::clone(&self.dead_letters),
                retry: self.settings.retry,
                abandon: abandon.clone(),
                slots: self.worker_slots.clone(),
                active: Arc::clone(&self.active_workers),
            };
            handles.push((partition, tokio::spawn(worker.run())));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut pending = handles.into_iter();
        while let Some((partition, handle)) = pending.next() {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(source) => {
                    for (_, rest) in pending.by_ref() {
                        rest.abort();
                    }
                    error!(partition, error = %source, "Partition worker failed");
                    return Err(ConsumerError::WorkerPanicked { partition, source });
                }
            }
        }

        for outcome in &outcomes {
            if let Some(offset) = outcome.resolved {
                self.position.advance(outcome.partition, offset);
            }
            self.stats.absorb(outcome);
        }

        let duration = started.elapsed();
        emit!(BatchCompleted {
            records: count,
            duration,
            topic,
        });
        debug!(
            records = count,
            partitions = outcomes.len(),
            duration_ms = duration.as_millis() as u64,
            "Batch resolved"
        );

        Ok(())
    }

    /// Send every resolved but unacknowledged offset to the log.
    async fn commit(
        &mut self,
        shutdown: &CancellationToken,
        grace_deadline: &OnceLock<Instant>,
    ) -> Result<(), ConsumerError> {
        let offsets = self.position.uncommitted();
        if offsets.is_empty() {
            return Ok(());
        }

        let mut backoff = self.settings.reconnect.backoff();
        if let Some(deadline) = grace_deadline.get() {
            backoff = backoff.with_deadline(*deadline);
        }

        loop {
            let error = match self.source.commit(&offsets).await {
                Ok(()) => {
                    self.position.mark_committed(&offsets);
                    self.stats.commits += 1;
                    emit!(OffsetsCommitted {
                        partitions: offsets.len() as u64,
                        topic: self.settings.topic.clone(),
                    });
                    debug!(?offsets, "Offsets committed");
                    return Ok(());
                }
                Err(e) => e,
            };

            emit!(CommitFailed {
                topic: self.settings.topic.clone(),
            });

            match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None if shutdown.is_cancelled() => {
                    warn!(
                        ?offsets,
                        error = %error,
                        "Commit failed during shutdown, records will be redelivered"
                    );
                    return Ok(());
                }
                None => {
                    error!(attempts = backoff.attempts(), error = %error, "Commit failed, giving up");
                    return Err(error).context(ConnectionSnafu {
                        attempts: backoff.attempts(),
                    });
                }
            }
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn position(&self) -> &ConsumptionPosition {
        &self.position
    }

    /// Log the run totals and the final position.
    pub fn finalize(&self) -> ConsumerStats {
        let stats = self.stats.clone();
        info!(
            topic = %self.settings.topic,
            batches = stats.batches,
            polled = stats.polled,
            persisted = stats.persisted,
            duplicates = stats.duplicates,
            dead_lettered = stats.dead_lettered,
            dropped = stats.dropped,
            abandoned = stats.abandoned,
            commits = stats.commits,
            "Consumer finalized"
        );
        for (partition, cursor) in self.position.partitions() {
            debug!(
                partition,
                resolved = ?cursor.resolved,
                committed = ?cursor.committed,
                "Final partition position"
            );
        }
        stats
    }
}

/// Fire `abandon` once `grace` has passed since `shutdown` was cancelled.
async fn watch_grace_period(
    shutdown: CancellationToken,
    abandon: CancellationToken,
    grace: Duration,
    deadline: Arc<OnceLock<Instant>>,
) {
    shutdown.cancelled().await;
    let grace = grace.min(MAX_GRACE_PERIOD);
    let at = Instant::now() + grace;
    let _ = deadline.set(at);
    debug!(grace_ms = grace.as_millis() as u64, "Shutdown grace period started");

    tokio::time::sleep_until(at).await;
    warn!("Grace period expired, abandoning in-flight records");
    abandon.cancel();
}
