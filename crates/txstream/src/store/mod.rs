//! Document store for persisted transactions.
//!
//! Writes are create-only and keyed by `transaction_id`, so replaying a record
//! after a crash yields [`StoreError::DuplicateKey`] instead of a second copy.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::sync::Arc;

use txstream_core::{StorageProvider, StorageProviderRef};

use crate::config::StoreConfig;
use crate::error::{SerializeSnafu, StorageError, StoreError, StoreWriteSnafu};
use crate::processor::Transaction;

/// Idempotent sink for validated transactions. Shared across workers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist `transaction` unless its business identifier already exists.
    async fn upsert(&self, transaction: &Transaction) -> Result<(), StoreError>;
}

/// One JSON document per transaction at `{collection}/{transaction_id}.json`.
#[derive(Debug, Clone)]
pub struct ObjectDocumentStore {
    storage: StorageProviderRef,
    collection: String,
}

impl ObjectDocumentStore {
    pub async fn from_config(config: &StoreConfig) -> Result<Self, StorageError> {
        let storage =
            StorageProvider::for_url_with_options(&config.url, config.storage_options.clone())
                .await?;
        Ok(Self::new(Arc::new(storage), config.collection.clone()))
    }

    pub fn new(storage: StorageProviderRef, collection: impl Into<String>) -> Self {
        Self {
            storage,
            collection: collection.into(),
        }
    }

    fn document_path(&self, transaction_id: &str) -> Path {
        Path::from(format!("{}/{transaction_id}.json", self.collection))
    }

    /// Read back a persisted transaction.
    pub async fn get(&self, transaction_id: &str) -> Result<Option<Transaction>, StoreError> {
        match self.storage.get(self.document_path(transaction_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .context(SerializeSnafu),
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(StoreError::StoreWrite { source }),
        }
    }
}

#[async_trait]
impl DocumentStore for ObjectDocumentStore {
    async fn upsert(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let body = serde_json::to_vec(transaction).context(SerializeSnafu)?;
        let path = self.document_path(&transaction.transaction_id);

        match self
            .storage
            .put_if_absent(&path, PutPayload::from(Bytes::from(body)))
            .await
        {
            Err(e) if e.is_already_exists() => Err(StoreError::DuplicateKey {
                transaction_id: transaction.transaction_id.clone(),
            }),
            other => other.context(StoreWriteSnafu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{SourceRef, TransactionKind};
    use chrono::Utc;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn transaction(id: &str) -> Transaction {
        Transaction {
            transaction_id: id.to_string(),
            account_id: "acc-1".to_string(),
            amount: 500,
            currency: "USD".to_string(),
            kind: TransactionKind::Debit,
            occurred_at: Utc::now(),
            processed_at: Utc::now(),
            source: SourceRef {
                topic: "transactions".to_string(),
                partition: 0,
                offset: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_upsert_then_duplicate() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            url: format!("file://{}", dir.path().display()),
            collection: "transactions".to_string(),
            storage_options: HashMap::new(),
        };
        let store = ObjectDocumentStore::from_config(&config).await.unwrap();

        let tx = transaction("tx-100");
        store.upsert(&tx).await.unwrap();
        assert!(dir.path().join("transactions/tx-100.json").exists());

        let err = store.upsert(&tx).await.unwrap_err();
        assert!(err.is_duplicate());

        let stored = store.get("tx-100").await.unwrap().unwrap();
        assert_eq!(stored, tx);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let storage = StorageProvider::for_url_with_options("memory://", HashMap::new())
            .await
            .unwrap();
        let store = ObjectDocumentStore::new(Arc::new(storage), "transactions");
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
