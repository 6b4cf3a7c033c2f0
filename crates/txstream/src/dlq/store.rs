//! Durable storage for dead-letter entries.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::PutPayload;
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use txstream_core::{StorageProvider, StorageProviderRef};

use super::types::DeadLetterEntry;
use crate::error::{DlqDecodeSnafu, DlqError, DlqReadSnafu, DlqSerializeSnafu, DlqWriteSnafu, StorageError};

/// Append-only store of dead-letter entries.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), DlqError>;
}

/// One JSON object per entry at
/// `{topic}/partition={p}/{offset:020}-{id}.json`.
///
/// Zero-padded offsets make a lexical listing of a partition prefix come back
/// in offset order.
#[derive(Debug, Clone)]
pub struct ObjectDeadLetterStore {
    storage: StorageProviderRef,
}

impl ObjectDeadLetterStore {
    pub async fn for_url(
        url: &str,
        storage_options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let storage = StorageProvider::for_url_with_options(url, storage_options).await?;
        Ok(Self::new(Arc::new(storage)))
    }

    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    pub fn entry_path(entry: &DeadLetterEntry) -> Path {
        Path::from(format!(
            "{}/partition={}/{:020}-{}.json",
            entry.topic, entry.partition, entry.offset, entry.id
        ))
    }

    /// Every stored entry, ordered by topic, partition and offset.
    pub async fn list(&self) -> Result<Vec<DeadLetterEntry>, DlqError> {
        let mut paths: Vec<Path> = self
            .storage
            .list_with_prefix("")
            .try_collect()
            .await
            .context(DlqReadSnafu { path: "/" })?;
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = self
                .storage
                .get(path.clone())
                .await
                .context(DlqReadSnafu {
                    path: path.to_string(),
                })?;
            entries.push(serde_json::from_slice(&bytes).context(DlqDecodeSnafu {
                path: path.to_string(),
            })?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl DeadLetterStore for ObjectDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), DlqError> {
        let body = serde_json::to_vec(entry).context(DlqSerializeSnafu)?;
        let path = Self::entry_path(entry);
        match self
            .storage
            .put_if_absent(&path, PutPayload::from(Bytes::from(body)))
            .await
        {
            Ok(()) => Ok(()),
            // Paths embed the entry id, so an existing object is an earlier attempt of this entry
            Err(e) if e.is_already_exists() => {
                debug!(path = %path, "Dead-letter entry already written");
                Ok(())
            }
            Err(e) => Err(e).context(DlqWriteSnafu),
        }
    }
}
