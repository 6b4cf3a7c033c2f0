//! In-process partitioned log.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::LogSource;
use crate::error::SourceError;
use crate::record::{Batch, Record};

/// A log held in memory.
///
/// Clones share state, so a test can keep a handle while the consumer owns
/// another one.
#[derive(Clone)]
pub struct MemorySource {
    topic: String,
    idle_wait: Duration,
    log: Arc<Mutex<MemoryLog>>,
}

#[derive(Default)]
struct MemoryLog {
    partitions: BTreeMap<i32, Vec<Record>>,
    /// Index of the next record to hand out, per partition.
    cursors: BTreeMap<i32, usize>,
    committed: BTreeMap<i32, i64>,
    commits: Vec<BTreeMap<i32, i64>>,
    failing_polls: u32,
    failing_commits: u32,
}

impl MemorySource {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            idle_wait: Duration::from_millis(10),
            log: Arc::new(Mutex::new(MemoryLog::default())),
        }
    }

    /// How long an idle poll waits before returning an empty batch.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Append a record and return its offset.
    pub async fn push(&self, partition: i32, payload: impl Into<Bytes>) -> i64 {
        self.push_keyed(partition, None, payload).await
    }

    pub async fn push_keyed(
        &self,
        partition: i32,
        key: Option<Bytes>,
        payload: impl Into<Bytes>,
    ) -> i64 {
        let mut log = self.log.lock().await;
        let records = log.partitions.entry(partition).or_default();
        let offset = records.len() as i64;
        records.push(Record {
            topic: self.topic.clone(),
            partition,
            offset,
            key,
            payload: payload.into(),
            received_at: Utc::now(),
        });
        offset
    }

    /// Make the next `count` polls fail.
    pub async fn fail_next_polls(&self, count: u32) {
        self.log.lock().await.failing_polls = count;
    }

    /// Make the next `count` commits fail.
    pub async fn fail_next_commits(&self, count: u32) {
        self.log.lock().await.failing_commits = count;
    }

    /// Last committed resolved offset per partition.
    pub async fn committed(&self) -> BTreeMap<i32, i64> {
        self.log.lock().await.committed.clone()
    }

    /// Every successful commit call, in order.
    pub async fn commit_history(&self) -> Vec<BTreeMap<i32, i64>> {
        self.log.lock().await.commits.clone()
    }

    /// Records appended but not yet handed out.
    pub async fn pending(&self) -> usize {
        let log = self.log.lock().await;
        log.partitions
            .iter()
            .map(|(p, records)| records.len() - log.cursors.get(p).copied().unwrap_or(0))
            .sum()
    }
}

#[async_trait]
impl LogSource for MemorySource {
    async fn poll(&mut self, max_records: usize) -> Result<Batch, SourceError> {
        let records = {
            let mut log = self.log.lock().await;
            if log.failing_polls > 0 {
                log.failing_polls -= 1;
                return Err(SourceError::SourceUnavailable {
                    message: "injected poll failure".to_string(),
                });
            }

            let MemoryLog {
                partitions,
                cursors,
                ..
            } = &mut *log;

            let mut records = Vec::new();
            for (partition, stored) in partitions.iter() {
                let cursor = cursors.entry(*partition).or_insert(0);
                while *cursor < stored.len() && records.len() < max_records {
                    records.push(stored[*cursor].clone());
                    *cursor += 1;
                }
            }
            records
        };

        if records.is_empty() {
            tokio::time::sleep(self.idle_wait).await;
        }
        Ok(Batch::new(records))
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        let mut log = self.log.lock().await;
        if log.failing_commits > 0 {
            log.failing_commits -= 1;
            return Err(SourceError::SourceUnavailable {
                message: "injected commit failure".to_string(),
            });
        }

        for (partition, offset) in offsets {
            log.committed.insert(*partition, *offset);
        }
        log.commits.push(offsets.clone());
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
