//! End-to-end consumer scenarios against the in-memory log and stores.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use txstream::consumer::{ConsumerSettings, RetryPolicy, TxConsumer};
use txstream::dlq::{
    Classification, DeadLetterEntry, DeadLetterSettings, DeadLetterSink, DeadLetterStore,
    ObjectDeadLetterStore,
};
use txstream::error::{ConsumerError, DlqError, StoreError};
use txstream::processor::{Processed, Transaction, TransactionProcessor};
use txstream::record::Record;
use txstream::source::MemorySource;
use txstream::store::{DocumentStore, ObjectDocumentStore};
use txstream_core::{StorageProvider, StorageProviderRef};

const TOPIC: &str = "transactions";

fn payload(id: &str) -> Bytes {
    Bytes::from(format!(
        r#"{{"transaction_id":"{id}","account_id":"acc-1","amount":1250,"currency":"EUR","kind":"credit","occurred_at":"2024-03-01T12:00:00Z"}}"#
    ))
}

fn invalid_payload(id: &str) -> Bytes {
    Bytes::from(format!(
        r#"{{"transaction_id":"{id}","account_id":"acc-1","amount":-5,"currency":"EUR","kind":"credit","occurred_at":"2024-03-01T12:00:00Z"}}"#
    ))
}

fn settings(records_per_poll: usize) -> ConsumerSettings {
    ConsumerSettings {
        topic: TOPIC.to_string(),
        records_per_poll,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        reconnect: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
        grace_period: Duration::from_secs(5),
        max_workers: None,
    }
}

fn dead_letter_settings() -> DeadLetterSettings {
    DeadLetterSettings {
        write_timeout: Duration::from_millis(200),
        max_attempts: 2,
        backoff: Duration::from_millis(5),
        max_in_flight: 4,
    }
}

async fn memory_storage() -> StorageProviderRef {
    Arc::new(
        StorageProvider::for_url_with_options("memory://", HashMap::new())
            .await
            .unwrap(),
    )
}

/// Collaborators shared by a consumer and the test observing it.
struct Fixture {
    source: MemorySource,
    documents: Arc<ObjectDocumentStore>,
    dead_letter_store: Arc<ObjectDeadLetterStore>,
}

impl Fixture {
    async fn new() -> Self {
        Self {
            source: MemorySource::new(TOPIC).with_idle_wait(Duration::from_millis(5)),
            documents: Arc::new(ObjectDocumentStore::new(memory_storage().await, TOPIC)),
            dead_letter_store: Arc::new(ObjectDeadLetterStore::new(memory_storage().await)),
        }
    }

    fn sink(&self) -> Arc<DeadLetterSink> {
        let store: Arc<dyn DeadLetterStore> = self.dead_letter_store.clone();
        Arc::new(DeadLetterSink::new(store, dead_letter_settings()))
    }

    fn consumer(&self, settings: ConsumerSettings) -> TxConsumer<MemorySource> {
        let store: Arc<dyn DocumentStore> = self.documents.clone();
        self.consumer_with(store, self.sink(), settings)
    }

    fn consumer_with(
        &self,
        store: Arc<dyn DocumentStore>,
        sink: Arc<DeadLetterSink>,
        settings: ConsumerSettings,
    ) -> TxConsumer<MemorySource> {
        TxConsumer::new(
            self.source.clone(),
            Arc::new(TransactionProcessor::new(store)),
            sink,
            settings,
        )
    }

    async fn persisted(&self, id: &str) -> bool {
        self.documents.get(id).await.unwrap().is_some()
    }
}

type Finished = (Result<(), ConsumerError>, TxConsumer<MemorySource>);

fn spawn(
    mut consumer: TxConsumer<MemorySource>,
    shutdown: CancellationToken,
    auto_commit: bool,
) -> JoinHandle<Finished> {
    tokio::spawn(async move {
        let result = consumer.poll(shutdown, auto_commit).await;
        (result, consumer)
    })
}

async fn join(handle: JoinHandle<Finished>) -> Finished {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("consumer did not stop in time")
        .unwrap()
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn offsets(pairs: &[(i32, i64)]) -> BTreeMap<i32, i64> {
    pairs.iter().copied().collect()
}

/// Fails the first `failures` writes as unavailable, then delegates.
struct FlakyStore {
    inner: Arc<ObjectDocumentStore>,
    failures: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn upsert(&self, transaction: &Transaction) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::StoreUnavailable {
                message: "connection reset".to_string(),
            });
        }
        self.inner.upsert(transaction).await
    }
}

/// Holds writes for one transaction until released.
struct GatedStore {
    inner: Arc<ObjectDocumentStore>,
    gated_id: String,
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl DocumentStore for GatedStore {
    async fn upsert(&self, transaction: &Transaction) -> Result<(), StoreError> {
        if transaction.transaction_id == self.gated_id {
            self.entered.notify_one();
            let _permit = self.release.acquire().await;
        }
        self.inner.upsert(transaction).await
    }
}

/// Panics on one transaction, delegates the rest.
struct PanickingStore {
    inner: Arc<dyn DocumentStore>,
    panic_id: String,
}

#[async_trait]
impl DocumentStore for PanickingStore {
    async fn upsert(&self, transaction: &Transaction) -> Result<(), StoreError> {
        if transaction.transaction_id == self.panic_id {
            panic!("store driver crashed on {}", self.panic_id);
        }
        self.inner.upsert(transaction).await
    }
}

struct DownDeadLetterStore;

#[async_trait]
impl DeadLetterStore for DownDeadLetterStore {
    async fn append(&self, _entry: &DeadLetterEntry) -> Result<(), DlqError> {
        Err(DlqError::DlqUnavailable {
            message: "bucket unreachable".to_string(),
        })
    }
}

#[tokio::test]
async fn test_invalid_record_is_dead_lettered_and_batch_commits() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.push(0, invalid_payload("tx-2")).await;
    fx.source.push(0, payload("tx-3")).await;

    let shutdown = CancellationToken::new();
    let handle = spawn(fx.consumer(settings(10)), shutdown.clone(), true);

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 2)]) }).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert!(fx.persisted("tx-1").await);
    assert!(!fx.persisted("tx-2").await);
    assert!(fx.persisted("tx-3").await);

    let entries = fx.dead_letter_store.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].partition, 0);
    assert_eq!(entries[0].offset, 1);
    assert_eq!(entries[0].classification, Classification::Validation);
    assert_eq!(entries[0].attempts, 1);
    assert!(entries[0].error.contains("amount"));
    assert_eq!(entries[0].decode_payload().unwrap(), invalid_payload("tx-2").to_vec());

    let stats = consumer.stats();
    assert_eq!(stats.persisted, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(consumer.position().committed(0), Some(2));
}

#[tokio::test]
async fn test_duplicate_from_prior_run_counts_as_success() {
    let fx = Fixture::new().await;

    let store: Arc<dyn DocumentStore> = fx.documents.clone();
    let earlier = TransactionProcessor::new(store);
    let replayed = Record {
        topic: TOPIC.to_string(),
        partition: 0,
        offset: 0,
        key: None,
        payload: payload("tx-7"),
        received_at: Utc::now(),
    };
    assert!(matches!(
        earlier.process(&replayed).await.unwrap(),
        Processed::Persisted(_)
    ));

    fx.source.push(0, payload("tx-7")).await;
    let shutdown = CancellationToken::new();
    let handle = spawn(fx.consumer(settings(10)), shutdown.clone(), true);

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 0)]) }).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert_eq!(consumer.stats().duplicates, 1);
    assert_eq!(consumer.stats().persisted, 0);
    assert!(fx.dead_letter_store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancellation_drains_batch_without_polling_more() {
    let fx = Fixture::new().await;
    for i in 1..=5 {
        fx.source.push(0, payload(&format!("tx-{i}"))).await;
    }

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Semaphore::new(0));
    let store: Arc<dyn DocumentStore> = Arc::new(GatedStore {
        inner: fx.documents.clone(),
        gated_id: "tx-3".to_string(),
        entered: entered.clone(),
        release: release.clone(),
    });

    let shutdown = CancellationToken::new();
    let consumer = fx.consumer_with(store, fx.sink(), settings(3));
    let handle = spawn(consumer, shutdown.clone(), true);

    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.add_permits(1);

    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert_eq!(fx.source.committed().await, offsets(&[(0, 2)]));
    assert_eq!(fx.source.pending().await, 2);
    assert!(fx.persisted("tx-3").await);
    assert!(!fx.persisted("tx-4").await);
    assert_eq!(consumer.stats().batches, 1);
    assert_eq!(consumer.stats().abandoned, 0);
}

#[tokio::test]
async fn test_stalled_record_is_abandoned_after_grace_period() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.push(0, payload("tx-2")).await;
    fx.source.push(0, payload("tx-stuck")).await;
    fx.source.push(0, payload("tx-4")).await;
    fx.source.push(1, payload("tx-5")).await;

    let entered = Arc::new(Notify::new());
    let store: Arc<dyn DocumentStore> = Arc::new(GatedStore {
        inner: fx.documents.clone(),
        gated_id: "tx-stuck".to_string(),
        entered: entered.clone(),
        release: Arc::new(Semaphore::new(0)),
    });

    let mut settings = settings(10);
    settings.grace_period = Duration::from_millis(100);

    let shutdown = CancellationToken::new();
    let consumer = fx.consumer_with(store, fx.sink(), settings);
    let handle = spawn(consumer, shutdown.clone(), true);

    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();
    shutdown.cancel();

    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert_eq!(fx.source.committed().await, offsets(&[(0, 1), (1, 0)]));
    assert!(!fx.persisted("tx-stuck").await);
    assert!(!fx.persisted("tx-4").await);
    assert!(fx.persisted("tx-5").await);
    assert_eq!(consumer.stats().abandoned, 2);
    assert_eq!(consumer.position().resolved(0), Some(1));
}

#[tokio::test]
async fn test_transient_failure_recovers_within_budget() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-flaky")).await;

    let flaky = Arc::new(FlakyStore {
        inner: fx.documents.clone(),
        failures: AtomicU32::new(2),
        calls: AtomicU32::new(0),
    });
    let store: Arc<dyn DocumentStore> = flaky.clone();

    let shutdown = CancellationToken::new();
    let handle = spawn(
        fx.consumer_with(store, fx.sink(), settings(10)),
        shutdown.clone(),
        true,
    );

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 0)]) }).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert!(fx.persisted("tx-flaky").await);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(consumer.stats().persisted, 1);
    assert!(fx.dead_letter_store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_persistent_failure_exhausts_retries() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-down")).await;

    let flaky = Arc::new(FlakyStore {
        inner: fx.documents.clone(),
        failures: AtomicU32::new(u32::MAX),
        calls: AtomicU32::new(0),
    });
    let store: Arc<dyn DocumentStore> = flaky.clone();

    let shutdown = CancellationToken::new();
    let handle = spawn(
        fx.consumer_with(store, fx.sink(), settings(10)),
        shutdown.clone(),
        true,
    );

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 0)]) }).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    let entries = fx.dead_letter_store.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].classification, Classification::RetriesExhausted);
    assert_eq!(entries[0].attempts, 3);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(consumer.stats().dead_lettered, 1);
}

#[tokio::test]
async fn test_poll_failures_past_budget_are_fatal() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.fail_next_polls(10).await;

    let (result, consumer) = join(spawn(
        fx.consumer(settings(10)),
        CancellationToken::new(),
        true,
    ))
    .await;

    match result {
        Err(ConsumerError::Connection { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected connection error, got {other:?}"),
    }
    assert_eq!(consumer.stats().batches, 0);
    assert_eq!(fx.source.pending().await, 1);
}

#[tokio::test]
async fn test_poll_failures_within_budget_recover() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.fail_next_polls(2).await;

    let shutdown = CancellationToken::new();
    let handle = spawn(fx.consumer(settings(10)), shutdown.clone(), true);

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 0)]) }).await;
    shutdown.cancel();
    join(handle).await.0.unwrap();
}

#[tokio::test]
async fn test_dry_run_advances_position_without_committing() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.push(0, payload("tx-2")).await;

    let shutdown = CancellationToken::new();
    let handle = spawn(fx.consumer(settings(10)), shutdown.clone(), false);

    eventually(|| async { fx.persisted("tx-2").await }).await;
    eventually(|| async { fx.source.pending().await == 0 }).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert!(fx.source.commit_history().await.is_empty());
    assert_eq!(consumer.position().resolved(0), Some(1));
    assert_eq!(consumer.position().committed(0), None);
    assert_eq!(consumer.stats().commits, 0);
}

#[tokio::test]
async fn test_dead_letter_outage_drops_record_and_advances() {
    let fx = Fixture::new().await;
    fx.source.push(0, invalid_payload("tx-bad")).await;
    fx.source.push(0, payload("tx-good")).await;

    let sink = Arc::new(DeadLetterSink::new(
        Arc::new(DownDeadLetterStore),
        dead_letter_settings(),
    ));
    let store: Arc<dyn DocumentStore> = fx.documents.clone();

    let shutdown = CancellationToken::new();
    let handle = spawn(
        fx.consumer_with(store, sink.clone(), settings(10)),
        shutdown.clone(),
        true,
    );

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 1)]) }).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert_eq!(consumer.stats().dropped, 1);
    assert_eq!(consumer.stats().persisted, 1);
    let failures = sink.finalize().await;
    assert_eq!(failures.dropped, 1);
    assert_eq!(failures.written(), 0);
}

#[tokio::test]
async fn test_malformed_record_does_not_halt_other_partitions() {
    let fx = Fixture::new().await;
    fx.source.push(0, Bytes::from_static(b"{not json")).await;
    fx.source.push(0, payload("tx-a")).await;
    fx.source.push(1, payload("tx-b")).await;
    fx.source.push(1, payload("tx-c")).await;
    fx.source.push(2, payload("tx-d")).await;

    let mut settings = settings(10);
    settings.max_workers = Some(1);

    let shutdown = CancellationToken::new();
    let handle = spawn(fx.consumer(settings), shutdown.clone(), true);

    eventually(|| async {
        fx.source.committed().await == offsets(&[(0, 1), (1, 1), (2, 0)])
    })
    .await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    for id in ["tx-a", "tx-b", "tx-c", "tx-d"] {
        assert!(fx.persisted(id).await, "{id} not persisted");
    }
    let entries = fx.dead_letter_store.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].partition, 0);
    assert_eq!(entries[0].offset, 0);
    assert_eq!(consumer.stats().dead_lettered, 1);
}

#[tokio::test]
async fn test_commit_failure_is_retried() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.fail_next_commits(2).await;

    let shutdown = CancellationToken::new();
    let handle = spawn(fx.consumer(settings(10)), shutdown.clone(), true);

    eventually(|| async { fx.source.committed().await == offsets(&[(0, 0)]) }).await;
    shutdown.cancel();
    let (result, consumer) = join(handle).await;
    result.unwrap();

    assert_eq!(fx.source.commit_history().await.len(), 1);
    assert_eq!(consumer.stats().commits, 1);
}

#[tokio::test]
async fn test_commit_failures_past_budget_are_fatal() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;
    fx.source.fail_next_commits(10).await;

    let (result, consumer) = join(spawn(
        fx.consumer(settings(10)),
        CancellationToken::new(),
        true,
    ))
    .await;

    match result {
        Err(ConsumerError::Connection { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected connection error, got {other:?}"),
    }
    assert!(fx.persisted("tx-1").await);
    assert!(fx.source.commit_history().await.is_empty());
    assert_eq!(consumer.position().resolved(0), Some(0));
    assert_eq!(consumer.position().committed(0), None);
    assert_eq!(consumer.stats().commits, 0);
}

#[tokio::test]
async fn test_commit_failure_during_shutdown_exits_cleanly() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-1")).await;

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Semaphore::new(0));
    let store: Arc<dyn DocumentStore> = Arc::new(GatedStore {
        inner: fx.documents.clone(),
        gated_id: "tx-1".to_string(),
        entered: entered.clone(),
        release: release.clone(),
    });

    let shutdown = CancellationToken::new();
    let handle = spawn(
        fx.consumer_with(store, fx.sink(), settings(10)),
        shutdown.clone(),
        true,
    );

    tokio::time::timeout(Duration::from_secs(5), entered.notified())
        .await
        .unwrap();
    shutdown.cancel();
    fx.source.fail_next_commits(10).await;
    release.add_permits(1);

    let (result, consumer) = join(handle).await;
    result.unwrap();

    // Left uncommitted, so the record is redelivered to the next consumer
    assert!(fx.persisted("tx-1").await);
    assert!(fx.source.commit_history().await.is_empty());
    assert_eq!(consumer.position().resolved(0), Some(0));
    assert_eq!(consumer.position().committed(0), None);
    assert_eq!(consumer.stats().persisted, 1);
}

#[tokio::test]
async fn test_worker_panic_aborts_remaining_partitions() {
    let fx = Fixture::new().await;
    fx.source.push(0, payload("tx-boom")).await;
    fx.source.push(1, payload("tx-held")).await;

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Semaphore::new(0));
    let gated: Arc<dyn DocumentStore> = Arc::new(GatedStore {
        inner: fx.documents.clone(),
        gated_id: "tx-held".to_string(),
        entered: entered.clone(),
        release: release.clone(),
    });
    let store: Arc<dyn DocumentStore> = Arc::new(PanickingStore {
        inner: gated,
        panic_id: "tx-boom".to_string(),
    });

    let (result, consumer) = join(spawn(
        fx.consumer_with(store, fx.sink(), settings(10)),
        CancellationToken::new(),
        true,
    ))
    .await;

    match result {
        Err(ConsumerError::WorkerPanicked { partition, source }) => {
            assert_eq!(partition, 0);
            assert!(source.is_panic());
        }
        other => panic!("expected worker panic, got {other:?}"),
    }

    // An aborted worker never resumes, even once its write is unblocked
    release.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!fx.persisted("tx-held").await);

    assert!(fx.source.commit_history().await.is_empty());
    assert_eq!(consumer.position().resolved(0), None);
    assert_eq!(consumer.position().resolved(1), None);
}
