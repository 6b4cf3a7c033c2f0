//! Per-partition consumption cursor.

use std::collections::BTreeMap;

/// Cursor for one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCursor {
    /// Highest offset whose record, and every record before it, is resolved.
    pub resolved: Option<i64>,
    /// Highest resolved offset the log has acknowledged.
    pub committed: Option<i64>,
}

/// How far consumption has progressed, owned by the coordinating task.
#[derive(Debug, Clone, Default)]
pub struct ConsumptionPosition {
    partitions: BTreeMap<i32, PartitionCursor>,
}

impl ConsumptionPosition {
    /// Move the resolved cursor forward. Never moves backwards.
    pub fn advance(&mut self, partition: i32, offset: i64) {
        let cursor = self.partitions.entry(partition).or_default();
        if cursor.resolved.is_none_or(|current| offset > current) {
            cursor.resolved = Some(offset);
        }
    }

    pub fn resolved(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|c| c.resolved)
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.partitions.get(&partition).and_then(|c| c.committed)
    }

    /// Resolved offsets the log has not acknowledged yet.
    pub fn uncommitted(&self) -> BTreeMap<i32, i64> {
        self.partitions
            .iter()
            .filter_map(|(partition, cursor)| match (cursor.resolved, cursor.committed) {
                (Some(resolved), Some(committed)) if resolved <= committed => None,
                (Some(resolved), _) => Some((*partition, resolved)),
                (None, _) => None,
            })
            .collect()
    }

    pub fn mark_committed(&mut self, offsets: &BTreeMap<i32, i64>) {
        for (partition, offset) in offsets {
            let cursor = self.partitions.entry(*partition).or_default();
            if cursor.committed.is_none_or(|current| *offset > current) {
                cursor.committed = Some(*offset);
            }
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = (i32, PartitionCursor)> + '_ {
        self.partitions.iter().map(|(p, c)| (*p, *c))
    }
}
