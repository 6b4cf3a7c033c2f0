//! Kafka log source backed by an rdkafka `StreamConsumer`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::LogSource;
use crate::config::KafkaConfig;
use crate::error::{KafkaSnafu, SourceError, TaskJoinSnafu, TopicNotFoundSnafu};
use crate::record::{Batch, Record};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    poll_timeout: Duration,
}

// rdkafka's StreamConsumer doesn't impl Debug
impl fmt::Debug for KafkaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSource")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaSource {
    /// Create the consumer, check the topic exists and subscribe to it.
    pub async fn connect(config: &KafkaConfig) -> Result<Self, SourceError> {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", config.brokers.join(","));
        cfg.set("group.id", &config.consumer_name);
        cfg.set("session.timeout.ms", config.session_timeout_ms.to_string());
        // Offsets are committed explicitly once records are resolved
        cfg.set("enable.auto.commit", "false");
        cfg.set("auto.offset.reset", "earliest");

        let consumer: StreamConsumer = cfg.create().context(KafkaSnafu)?;
        let consumer = Arc::new(consumer);

        let partitions = Self::probe_topic(&consumer, &config.topic).await?;
        info!(topic = %config.topic, partitions, "Found Kafka topic");

        consumer
            .subscribe(&[config.topic.as_str()])
            .context(KafkaSnafu)?;

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        })
    }

    /// Fetch topic metadata to verify the brokers are reachable.
    async fn probe_topic(consumer: &Arc<StreamConsumer>, topic: &str) -> Result<usize, SourceError> {
        let probe = Arc::clone(consumer);
        let name = topic.to_string();
        let metadata = tokio::task::spawn_blocking(move || {
            probe.fetch_metadata(Some(&name), METADATA_TIMEOUT)
        })
        .await
        .context(TaskJoinSnafu)?
        .context(KafkaSnafu)?;

        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none())
            .map(|t| t.partitions().len())
            .unwrap_or(0);

        ensure!(partitions > 0, TopicNotFoundSnafu { topic });
        Ok(partitions)
    }
}

#[async_trait]
impl LogSource for KafkaSource {
    async fn poll(&mut self, max_records: usize) -> Result<Batch, SourceError> {
        let deadline = Instant::now() + self.poll_timeout;
        let mut records = Vec::with_capacity(max_records);

        while records.len() < max_records {
            let message = match timeout_at(deadline, self.consumer.recv()).await {
                Err(_elapsed) => break,
                Ok(Ok(message)) => message,
                Ok(Err(e)) if records.is_empty() => return Err(e).context(KafkaSnafu),
                Ok(Err(e)) => {
                    // Hand out what we have; the error resurfaces on the next poll
                    warn!(topic = %self.topic, error = %e, "Kafka receive failed mid-batch");
                    break;
                }
            };

            records.push(Record {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(Bytes::copy_from_slice),
                payload: message
                    .payload()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default(),
                received_at: Utc::now(),
            });
        }

        if !records.is_empty() {
            debug!(topic = %self.topic, count = records.len(), "Polled records");
        }
        Ok(Batch::new(records))
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), SourceError> {
        let mut assignment = TopicPartitionList::new();
        for (partition, offset) in offsets {
            // Kafka stores the next offset to read
            assignment
                .add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
                .context(KafkaSnafu)?;
        }

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&assignment, CommitMode::Sync))
            .await
            .context(TaskJoinSnafu)?
            .context(KafkaSnafu)
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
