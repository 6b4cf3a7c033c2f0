//! Partitioned log sources.
//!
//! The consumer loop only talks to a [`LogSource`]: Kafka in production, an
//! in-process log in tests and local runs.

mod kafka;
mod memory;

pub use kafka::KafkaSource;
pub use memory::MemorySource;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::SourceError;
use crate::record::Batch;

/// A partitioned, offset-addressed log.
///
/// Both methods are called only from the coordinating task.
#[async_trait]
pub trait LogSource: Send {
    /// Pull up to `max_records`. An empty batch means the poll timed out idle.
    async fn poll(&mut self, max_records: usize) -> Result<Batch, SourceError>;

    /// Persist consumption progress. `offsets` maps each partition to its
    /// highest resolved offset.
    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), SourceError>;

    /// Name of the stream being consumed.
    fn topic(&self) -> &str;
}
