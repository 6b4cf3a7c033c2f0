//! tx-stream: consume transaction events from Kafka into a document store.
//!
//! This crate handles:
//! - Polling a partitioned log in bounded batches
//! - Validating and persisting each record idempotently
//! - Retrying transient failures and routing terminal ones to a dead-letter store
//! - Committing consumption positions only for resolved records
//! - Draining in-flight work on shutdown, bounded by a grace period

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod processor;
pub mod record;
pub mod source;
pub mod store;

use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use txstream_core::{ShutdownController, init_metrics};

pub use config::Config;
pub use consumer::{ConsumerSettings, ConsumerStats, TxConsumer};
pub use error::{AppError, ConsumerError};
pub use txstream_core::{CliArgs, init_tracing};

use consumer::connect_with_retry;
use dlq::{DeadLetterSink, ObjectDeadLetterStore};
use error::{AddressParseSnafu, ConnectSnafu, MetricsSnafu, StorageSnafu};
use processor::TransactionProcessor;
use source::KafkaSource;
use store::ObjectDocumentStore;

/// Wire up every collaborator from `config` and consume until shutdown.
pub async fn run(config: Config) -> Result<(), AppError> {
    if !config.is_prod_mode {
        info!(config = ?config.redacted(), "Effective configuration");
    }

    if config.metrics.enabled {
        let addr = config
            .metrics
            .address
            .parse::<SocketAddr>()
            .context(AddressParseSnafu)?;
        init_metrics(addr).context(MetricsSnafu)?;
    }

    let settings = config.consumer_settings()?;
    let dead_letter_settings = config.dead_letter_settings()?;

    let store = ObjectDocumentStore::from_config(&config.store)
        .await
        .context(StorageSnafu)?;
    let dead_letter_store = ObjectDeadLetterStore::for_url(
        &config.dead_letter.url,
        config.dead_letter.storage_options.clone(),
    )
    .await
    .context(StorageSnafu)?;

    let processor = Arc::new(TransactionProcessor::new(Arc::new(store)));
    let dead_letters = Arc::new(DeadLetterSink::new(
        Arc::new(dead_letter_store),
        dead_letter_settings,
    ));

    let kafka = &config.kafka;
    let endpoint = kafka.brokers.join(",");
    let source = connect_with_retry(&settings.reconnect, &endpoint, || {
        KafkaSource::connect(kafka)
    })
    .await
    .context(ConnectSnafu)?;

    info!(
        brokers = %endpoint,
        topic = %kafka.topic,
        group = %kafka.consumer_name,
        auto_commit = kafka.consume,
        "Connected to Kafka"
    );
    if !kafka.consume {
        warn!("kafka.consume is false, positions will not be committed");
    }

    let mut shutdown = ShutdownController::install();
    let mut consumer = TxConsumer::new(source, processor, Arc::clone(&dead_letters), settings);

    let result = consumer.poll(shutdown.token(), kafka.consume).await;
    shutdown.release();

    consumer.finalize();
    dead_letters.finalize().await;

    result.map_err(AppError::from)
}
