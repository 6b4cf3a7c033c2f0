//! Per-record business logic: validate, map, persist.

mod transaction;

pub use transaction::{SourceRef, Transaction, TransactionKind, TransactionPayload};

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::error::ProcessError;
use crate::record::Record;
use crate::store::DocumentStore;

/// Successful outcome of processing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Written for the first time.
    Persisted(Transaction),
    /// Already in the store from an earlier delivery.
    Duplicate(Transaction),
}

/// Stateless apart from the store handle; safe to share across workers.
pub struct TransactionProcessor {
    store: Arc<dyn DocumentStore>,
}

impl TransactionProcessor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn process(&self, record: &Record) -> Result<Processed, ProcessError> {
        let now = Utc::now();
        let payload = TransactionPayload::parse(&record.payload)?;
        payload.validate(now)?;
        let transaction = payload.into_transaction(record, now);

        match self.store.upsert(&transaction).await {
            Ok(()) => Ok(Processed::Persisted(transaction)),
            Err(e) if e.is_duplicate() => {
                debug!(
                    transaction_id = %transaction.transaction_id,
                    partition = record.partition,
                    offset = record.offset,
                    "Transaction already persisted"
                );
                Ok(Processed::Duplicate(transaction))
            }
            Err(source) => Err(ProcessError::Persistence { source }),
        }
    }
}
