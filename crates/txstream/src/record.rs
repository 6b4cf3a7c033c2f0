//! Records pulled from the log and the batches that carry them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// One message read from the log. Never mutated after it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    /// Monotonic within the partition.
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Records returned by a single poll, possibly spanning partitions.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Split into per-partition runs in ascending offset order.
    pub fn into_partitions(self) -> BTreeMap<i32, Vec<Record>> {
        let mut partitions: BTreeMap<i32, Vec<Record>> = BTreeMap::new();
        for record in self.records {
            partitions.entry(record.partition).or_default().push(record);
        }
        for records in partitions.values_mut() {
            records.sort_by_key(|r| r.offset);
        }
        partitions
    }
}
